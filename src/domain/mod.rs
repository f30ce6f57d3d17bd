pub mod evidence;
pub mod ids;
pub mod message;
pub mod transport;

pub use evidence::{Action, EvidenceType, MessageConfirmation, RejectionReason};
pub use ids::{BusinessDomainId, ConnectorMessageId, LinkPartnerName, TransportId};
pub use message::{
    Message, MessageContent, MessageDetails, MessageDirection, MessageTarget, Party, Service,
};
pub use transport::{
    MessageError, StatusUpdate, TransportState, TransportStatusUpdate, TransportStep,
};
