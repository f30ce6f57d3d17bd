//! Units of work of the inbound queue and the hand-over to link partners.

pub mod cleanup;
pub mod listener;
pub mod outbox;
pub mod submit;
pub mod to_backend;
pub mod to_gateway;

#[cfg(test)]
pub(crate) mod testing;

pub use cleanup::CleanupHandler;
pub use listener::MessageListener;
pub use outbox::{OutboundMessage, Outbox, OutboxPublisher};
pub use submit::{build_evidence_message, EvidenceRoute, LinkSubmitter};
pub use to_backend::ToBackendProcessor;
pub use to_gateway::ToGatewayProcessor;
