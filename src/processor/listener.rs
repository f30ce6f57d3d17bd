use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::{BusinessDomainId, Message, MessageTarget};
use crate::error::{ConnectorError, Result};
use crate::evidence::EvidenceProcessor;
use crate::queue::QueueHandler;
use crate::storage::Storage;
use crate::tenant::BusinessDomainContext;

use super::outbox::{Outbox, OutboxPublisher};
use super::to_backend::ToBackendProcessor;
use super::to_gateway::ToGatewayProcessor;

/// Consumer of the inbound queue.
///
/// Every delivery is one unit of work, run with the message's business
/// domain as the current one. Storage writes commit after the queue writes
/// were published; a failed delivery leaves nothing behind.
pub struct MessageListener {
    storage: Arc<dyn Storage>,
    evidence: Arc<EvidenceProcessor>,
    to_gateway: ToGatewayProcessor,
    to_backend: ToBackendProcessor,
    publisher: OutboxPublisher,
}

impl MessageListener {
    pub fn new(
        storage: Arc<dyn Storage>,
        evidence: Arc<EvidenceProcessor>,
        to_gateway: ToGatewayProcessor,
        to_backend: ToBackendProcessor,
        publisher: OutboxPublisher,
    ) -> Self {
        MessageListener {
            storage,
            evidence,
            to_gateway,
            to_backend,
            publisher,
        }
    }

    /// Run the unit of work for `message` and return its queue writes.
    pub async fn process(&self, tenant: &BusinessDomainId, message: Message) -> Result<Outbox> {
        let mut outbox = Outbox::new();

        if message.is_evidence_message() {
            self.evidence
                .process_evidence_message(tenant, &message, &mut outbox)
                .await?;
        } else if message.is_business_message() {
            match message.direction().target() {
                MessageTarget::Gateway => self.to_gateway.process(tenant, message, &mut outbox).await?,
                MessageTarget::Backend => self.to_backend.process(tenant, message, &mut outbox).await?,
            }
        } else {
            return Err(ConnectorError::illegal_message(
                &message.connector_message_id,
                "neither a business nor an evidence message",
            ));
        }

        Ok(outbox)
    }
}

#[async_trait]
impl QueueHandler<Message> for MessageListener {
    async fn handle(&self, payload: &Message) -> Result<()> {
        BusinessDomainContext::scope(payload.tenant.clone(), async {
            let tenant = BusinessDomainContext::require()?;
            debug!(
                tenant = %tenant,
                connector_message_id = %payload.connector_message_id,
                direction = %payload.direction(),
                "Processing inbound message"
            );

            let unit = self.storage.begin().await?;
            unit.run(async {
                let outbox = self.process(&tenant, payload.clone()).await?;
                self.publisher.publish(outbox).await
            })
            .await
            .map_err(|e| {
                error!(
                    tenant = %tenant,
                    connector_message_id = %payload.connector_message_id,
                    error = %e,
                    "Unit of work failed"
                );
                e
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        EvidenceType, MessageConfirmation, MessageContent, MessageDetails, MessageDirection,
    };
    use crate::observability::tracing::init_test_tracing;
    use crate::processor::testing::{services, Services};
    use crate::queue::{ConnectorQueues, MessageQueue};
    use std::time::Duration;

    fn listener(s: &Services, queues: ConnectorQueues) -> MessageListener {
        MessageListener::new(
            s.storage.clone(),
            s.evidence.clone(),
            ToGatewayProcessor::new(
                s.storage.clone(),
                s.confirmations.clone(),
                s.recorder.clone(),
                s.submitter.clone(),
                s.metrics.clone(),
            ),
            ToBackendProcessor::new(
                s.storage.clone(),
                s.routing.clone(),
                s.confirmations.clone(),
                s.recorder.clone(),
                s.submitter.clone(),
                s.metrics.clone(),
            ),
            OutboxPublisher::new(queues),
        )
    }

    fn incoming() -> Message {
        let mut details = MessageDetails::new(MessageDirection::GatewayToBackend);
        details.ebms_message_id = Some("E1".to_string());
        Message::business(
            BusinessDomainId::default_lane(),
            details,
            MessageContent::new("doc.xml", b"<doc/>".to_vec()),
        )
    }

    #[tokio::test]
    async fn test_dispatch_by_message_kind() {
        init_test_tracing();
        let s = services(None);
        let listener = listener(&s, ConnectorQueues::in_memory(1, Duration::ZERO));
        let lane = BusinessDomainId::default_lane();

        let outbox = listener.process(&lane, incoming()).await.unwrap();
        assert_eq!(outbox.to_target(MessageTarget::Backend).count(), 1);
        assert_eq!(outbox.to_target(MessageTarget::Gateway).count(), 1);

        let mut details = MessageDetails::new(MessageDirection::BackendToGateway);
        details.ref_to_message_id = Some("E1".to_string());
        let trigger = Message::evidence(lane.clone(), details, MessageConfirmation::trigger(EvidenceType::Delivery));

        let outbox = listener.process(&lane, trigger).await.unwrap();
        assert_eq!(outbox.to_target(MessageTarget::Gateway).count(), 1);
        assert_eq!(outbox.cleanup.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_publishes_outbox() {
        let s = services(None);
        let queues = ConnectorQueues::in_memory(1, Duration::ZERO);
        let listener = listener(&s, queues.clone());

        listener.handle(&incoming()).await.unwrap();

        let first = queues.to_link.receive().await.unwrap();
        let second = queues.to_link.receive().await.unwrap();
        let mut targets = vec![first.payload.target, second.payload.target];
        targets.sort_by_key(|t| *t == MessageTarget::Gateway);
        assert_eq!(targets, vec![MessageTarget::Backend, MessageTarget::Gateway]);
        assert!(BusinessDomainContext::current().is_none());
    }

    #[tokio::test]
    async fn test_failed_trigger_is_rolled_back_and_redelivery_sends_evidence() {
        let s = services(None);
        let queues = ConnectorQueues::in_memory(1, Duration::ZERO);
        let listener = listener(&s, queues.clone());

        let business = incoming();
        listener.handle(&business).await.unwrap();
        queues.to_link.receive().await.unwrap();
        queues.to_link.receive().await.unwrap();

        let mut details = MessageDetails::new(MessageDirection::BackendToGateway);
        details.ref_to_message_id = Some("E1".to_string());
        let trigger = Message::evidence(
            BusinessDomainId::default_lane(),
            details,
            MessageConfirmation::trigger(EvidenceType::Delivery),
        );

        s.store.fail_on("create_transport_step");
        let err = listener.handle(&trigger).await.unwrap_err();
        assert!(err.is_retryable());

        let stored = s.store.get_message(&business.connector_message_id).await.unwrap().unwrap();
        assert!(!stored.has_related_confirmation(EvidenceType::Delivery));
        assert!(stored.details.confirmed.is_none());

        s.store.clear_failures();
        listener.handle(&trigger).await.unwrap();

        let sent = queues.to_link.receive().await.unwrap().payload;
        assert_eq!(sent.target, MessageTarget::Gateway);
        assert_eq!(sent.message.evidence_type(), Some(EvidenceType::Delivery));
        let stored = s.store.get_message(&business.connector_message_id).await.unwrap().unwrap();
        assert!(stored.has_related_confirmation(EvidenceType::Delivery));
        assert!(stored.details.confirmed.is_some());
    }

    #[tokio::test]
    async fn test_unknown_tenant_fails_without_publishing() {
        let s = services(None);
        let queues = ConnectorQueues::in_memory(1, Duration::ZERO);
        let listener = listener(&s, queues.clone());

        let mut msg = incoming();
        msg.tenant = BusinessDomainId::new("lane9");
        let err = listener.handle(&msg).await.unwrap_err();

        assert!(matches!(err, ConnectorError::UnknownBusinessDomain(_)));
        assert!(!err.is_retryable());
        let nothing = tokio::time::timeout(Duration::from_millis(20), queues.to_link.receive()).await;
        assert!(nothing.is_err());
    }
}
