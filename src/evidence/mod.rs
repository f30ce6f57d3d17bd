pub mod confirmation;
pub mod correlator;
pub mod processor;
pub mod state;
pub mod timeout;

pub use confirmation::{
    ConfirmationCreator, EvidenceActionTable, EvidenceToolkit, UnsignedEvidenceToolkit,
};
pub use correlator::find_business_message;
pub use processor::EvidenceProcessor;
pub use state::{ConfirmationOutcome, ConfirmationRecorder, NotRelevant};
pub use timeout::{
    check_timeout, EvidenceTimeoutProcessor, EvidenceTimeouts, TimeoutReport, TimeoutVerdict,
};
