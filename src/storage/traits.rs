use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    BusinessDomainId, ConnectorMessageId, EvidenceType, LinkPartnerName, Message,
    MessageConfirmation, MessageDirection, MessageError, MessageTarget, TransportId, TransportStep,
};
use crate::routing::RoutingRule;

use super::unit_of_work::UnitOfWork;

/// Error reported for a transport, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageErrorRecord {
    pub transport_id: TransportId,
    pub connector_message_id: ConnectorMessageId,
    pub error: MessageError,
    pub created: DateTime<Utc>,
}

/// Storage trait for connector persistence.
///
/// A call made outside a unit of work commits on its own. Calls made
/// inside [`UnitOfWork::run`] see each other's writes and commit or roll
/// back together.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a unit of work on this store.
    async fn begin(&self) -> anyhow::Result<UnitOfWork>;

    // Messages
    /// Insert or replace a message. Related confirmations already stored
    /// for the message are kept.
    async fn persist_message(&self, message: &Message) -> anyhow::Result<()>;
    async fn get_message(&self, id: &ConnectorMessageId) -> anyhow::Result<Option<Message>>;
    async fn find_message_by_ebms_id(
        &self,
        tenant: &BusinessDomainId,
        ebms_id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>>;
    async fn find_message_by_backend_id(
        &self,
        tenant: &BusinessDomainId,
        backend_id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>>;
    async fn find_messages_by_conversation_id(
        &self,
        tenant: &BusinessDomainId,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<Message>>;
    /// Store the id a link partner assigned: the ebms id for the gateway,
    /// the backend id for the backend.
    async fn set_remote_message_id(
        &self,
        id: &ConnectorMessageId,
        target: MessageTarget,
        remote_id: &str,
    ) -> anyhow::Result<()>;
    async fn set_delivered(
        &self,
        id: &ConnectorMessageId,
        target: MessageTarget,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
    async fn confirm_message(&self, id: &ConnectorMessageId, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn reject_message(&self, id: &ConnectorMessageId, at: DateTime<Utc>) -> anyhow::Result<()>;
    /// Drop the document bytes of a finished message, keeping its metadata.
    async fn clear_message_content(&self, id: &ConnectorMessageId) -> anyhow::Result<()>;
    /// Business messages sent to the gateway, delivered, neither confirmed
    /// nor rejected, without related evidence of `min_priority` or higher.
    async fn find_messages_awaiting_evidence(
        &self,
        tenant: &BusinessDomainId,
        min_priority: u8,
    ) -> anyhow::Result<Vec<Message>>;

    // Confirmations
    async fn add_related_confirmation(
        &self,
        id: &ConnectorMessageId,
        confirmation: &MessageConfirmation,
    ) -> anyhow::Result<()>;
    async fn set_confirmation_transported(
        &self,
        id: &ConnectorMessageId,
        evidence_type: EvidenceType,
        target: MessageTarget,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    // Transport steps
    async fn create_transport_step(&self, step: &TransportStep) -> anyhow::Result<()>;
    async fn update_transport_step(&self, step: &TransportStep) -> anyhow::Result<()>;
    async fn get_transport_step(&self, id: &TransportId) -> anyhow::Result<Option<TransportStep>>;
    /// Highest attempt recorded for a message and link, 0 if none.
    async fn highest_attempt(
        &self,
        id: &ConnectorMessageId,
        link: &LinkPartnerName,
    ) -> anyhow::Result<u32>;
    /// Steps of a link that did not reach a final state.
    async fn open_transport_steps(&self, link: &LinkPartnerName) -> anyhow::Result<Vec<TransportStep>>;

    // Errors
    async fn persist_message_error(&self, record: &MessageErrorRecord) -> anyhow::Result<()>;
    async fn message_errors(&self, id: &ConnectorMessageId) -> anyhow::Result<Vec<MessageErrorRecord>>;

    // Routing
    /// Durable rules of a tenant, most recently written first.
    async fn list_routing_rules(&self, tenant: &BusinessDomainId) -> anyhow::Result<Vec<RoutingRule>>;
    async fn save_routing_rule(&self, tenant: &BusinessDomainId, rule: &RoutingRule) -> anyhow::Result<()>;
    /// Returns false if no rule with that id was stored.
    async fn delete_routing_rule(&self, tenant: &BusinessDomainId, rule_id: &str) -> anyhow::Result<bool>;
    async fn get_default_destination(
        &self,
        tenant: &BusinessDomainId,
    ) -> anyhow::Result<Option<LinkPartnerName>>;
    async fn set_default_destination(
        &self,
        tenant: &BusinessDomainId,
        link: &LinkPartnerName,
    ) -> anyhow::Result<()>;
}
