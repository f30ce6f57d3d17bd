use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{BusinessDomainId, ConnectorMessageId, Message, MessageConfirmation, MessageTarget};
use crate::error::{ConnectorError, Result};
use crate::observability::MetricsRegistry;
use crate::processor::{EvidenceRoute, LinkSubmitter, Outbox};
use crate::storage::Storage;
use crate::tenant::TenantRegistry;

use super::confirmation::ConfirmationCreator;
use super::correlator::find_business_message;
use super::state::{ConfirmationOutcome, ConfirmationRecorder};

/// Handles evidence messages and evidence triggers.
///
/// Evidence is related to its business message, updates the confirmed or
/// rejected state and is sent back to the sender of the business message.
pub struct EvidenceProcessor {
    storage: Arc<dyn Storage>,
    tenants: Arc<TenantRegistry>,
    confirmations: Arc<ConfirmationCreator>,
    recorder: Arc<ConfirmationRecorder>,
    submitter: Arc<LinkSubmitter>,
    metrics: Arc<MetricsRegistry>,
}

impl EvidenceProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        tenants: Arc<TenantRegistry>,
        confirmations: Arc<ConfirmationCreator>,
        recorder: Arc<ConfirmationRecorder>,
        submitter: Arc<LinkSubmitter>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        EvidenceProcessor {
            storage,
            tenants,
            confirmations,
            recorder,
            submitter,
            metrics,
        }
    }

    /// Process an evidence message received from a link partner.
    ///
    /// Triggers go to [`EvidenceProcessor::process_evidence_trigger`].
    pub async fn process_evidence_message(
        &self,
        tenant: &BusinessDomainId,
        message: &Message,
        outbox: &mut Outbox,
    ) -> Result<()> {
        if !message.is_evidence_message() {
            return Err(ConnectorError::illegal_message(
                &message.connector_message_id,
                "message does not transport exactly one confirmation",
            ));
        }
        if message.is_evidence_trigger() {
            return self.process_evidence_trigger(tenant, message, outbox).await;
        }

        let confirmation = message.transported_confirmations[0].clone();
        let business =
            find_business_message(self.storage.as_ref(), tenant, message, message.direction().revert())
                .await?;
        self.check_action(tenant, message, &confirmation)?;

        info!(
            tenant = %tenant,
            connector_message_id = %message.connector_message_id,
            business_message_id = %business.connector_message_id,
            evidence_type = %confirmation.evidence_type,
            "Received evidence for business message"
        );

        self.apply_confirmation(
            tenant,
            business,
            confirmation,
            Some(message.connector_message_id.clone()),
            false,
            outbox,
        )
        .await
    }

    /// Generate the evidence a backend asked for.
    ///
    /// Processing the same trigger again does not create a second
    /// confirmation of that type.
    pub async fn process_evidence_trigger(
        &self,
        tenant: &BusinessDomainId,
        trigger: &Message,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let Some(evidence_type) = trigger.evidence_type().filter(|_| trigger.is_evidence_trigger()) else {
            return Err(ConnectorError::illegal_message(
                &trigger.connector_message_id,
                "message is not an evidence trigger",
            ));
        };
        if trigger.direction().source() != MessageTarget::Backend {
            return Err(ConnectorError::illegal_message(
                &trigger.connector_message_id,
                "evidence triggers are only accepted from a backend",
            ));
        }

        let business =
            find_business_message(self.storage.as_ref(), tenant, trigger, trigger.direction().revert())
                .await?;

        if business.has_related_confirmation(evidence_type) {
            info!(
                tenant = %tenant,
                connector_message_id = %trigger.connector_message_id,
                business_message_id = %business.connector_message_id,
                evidence_type = %evidence_type,
                "Evidence already generated for business message, trigger ignored"
            );
            return Ok(());
        }

        let confirmation = self
            .confirmations
            .create_confirmation(evidence_type, &business, None, None)
            .await?;
        self.metrics.record_evidence_created();

        info!(
            tenant = %tenant,
            connector_message_id = %trigger.connector_message_id,
            business_message_id = %business.connector_message_id,
            evidence_type = %evidence_type,
            "Generated evidence from backend trigger"
        );

        self.apply_confirmation(
            tenant,
            business,
            confirmation,
            Some(trigger.connector_message_id.clone()),
            true,
            outbox,
        )
        .await
    }

    /// Relate `confirmation` to `business` and send it on.
    ///
    /// Evidence that is not relevant for the business message is stored
    /// but not forwarded. Generated evidence also goes to the backend when
    /// the tenant forwards generated evidence.
    pub async fn apply_confirmation(
        &self,
        tenant: &BusinessDomainId,
        mut business: Message,
        confirmation: MessageConfirmation,
        evidence_id: Option<ConnectorMessageId>,
        generated: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let outcome = self
            .recorder
            .process_confirmation_for_message(&mut business, &confirmation)
            .await?;
        self.metrics.record_confirmation(&outcome);

        if let ConfirmationOutcome::NotRelevant(reason) = outcome {
            info!(
                tenant = %tenant,
                business_message_id = %business.connector_message_id,
                evidence_type = %confirmation.evidence_type,
                "Evidence not forwarded: {}",
                reason
            );
            return Ok(());
        }

        if business.details.is_confirmed_or_rejected() {
            outbox.cleanup(business.connector_message_id.clone());
        }

        self.submitter
            .submit_confirmation(
                tenant,
                evidence_id,
                &business,
                &confirmation,
                EvidenceRoute::Opposite,
                outbox,
            )
            .await?;

        if generated && self.tenants.get(tenant)?.config.evidence.send_generated_evidences_to_backend {
            debug!(
                tenant = %tenant,
                business_message_id = %business.connector_message_id,
                "Sending generated evidence to backend"
            );
            self.submitter
                .submit_confirmation(tenant, None, &business, &confirmation, EvidenceRoute::Same, outbox)
                .await?;
        }

        Ok(())
    }

    fn check_action(
        &self,
        tenant: &BusinessDomainId,
        message: &Message,
        confirmation: &MessageConfirmation,
    ) -> Result<()> {
        let expected = self
            .confirmations
            .create_evidence_action(tenant, confirmation.evidence_type)?;
        if message.details.action.as_ref() == Some(&expected) {
            return Ok(());
        }

        let received = message
            .details
            .action
            .as_ref()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        if self.tenants.get(tenant)?.config.evidence.enforce_action_names {
            return Err(ConnectorError::illegal_message(
                &message.connector_message_id,
                format!(
                    "action [{}] does not match evidence type {} (expected [{}])",
                    received, confirmation.evidence_type, expected
                ),
            ));
        }

        warn!(
            tenant = %tenant,
            connector_message_id = %message.connector_message_id,
            action = %received,
            expected = %expected,
            "Evidence message action does not match its evidence type"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::domain::{
        Action, EvidenceType, LinkPartnerName, MessageContent, MessageDetails, MessageDirection,
    };
    use crate::evidence::UnsignedEvidenceToolkit;
    use crate::routing::RoutingRuleRegistry;
    use crate::storage::MemoryStore;
    use crate::transport::TransportStateService;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        processor: EvidenceProcessor,
    }

    fn fixture(configure: impl FnOnce(&mut ConnectorConfig)) -> Fixture {
        let mut config = ConnectorConfig::single_tenant(
            BusinessDomainId::default_lane(),
            LinkPartnerName::new("backend-a"),
            LinkPartnerName::new("gw"),
        );
        configure(&mut config);

        let store = Arc::new(MemoryStore::new());
        let storage: Arc<dyn Storage> = store.clone();
        let metrics = Arc::new(MetricsRegistry::new());
        let tenants = Arc::new(TenantRegistry::new(Arc::new(config)));
        let confirmations = Arc::new(ConfirmationCreator::new(
            Arc::new(UnsignedEvidenceToolkit),
            tenants.clone(),
        ));
        let submitter = Arc::new(LinkSubmitter::new(
            tenants.clone(),
            Arc::new(RoutingRuleRegistry::new(tenants.clone(), storage.clone())),
            Arc::new(TransportStateService::new(storage.clone(), metrics.clone())),
            confirmations.clone(),
        ));

        Fixture {
            store,
            processor: EvidenceProcessor::new(
                storage.clone(),
                tenants,
                confirmations,
                Arc::new(ConfirmationRecorder::new(storage)),
                submitter,
                metrics,
            ),
        }
    }

    async fn stored_business(store: &MemoryStore, direction: MessageDirection) -> Message {
        let mut details = MessageDetails::new(direction);
        details.ebms_message_id = Some("E1".to_string());
        details.backend_message_id = Some("B1".to_string());
        let msg = Message::business(
            BusinessDomainId::default_lane(),
            details,
            MessageContent::new("doc.xml", b"<doc/>".to_vec()),
        );
        store.persist_message(&msg).await.unwrap();
        msg
    }

    fn trigger(evidence_type: EvidenceType, direction: MessageDirection) -> Message {
        let mut details = MessageDetails::new(direction);
        details.ref_to_message_id = Some("E1".to_string());
        Message::evidence(
            BusinessDomainId::default_lane(),
            details,
            MessageConfirmation::trigger(evidence_type),
        )
    }

    fn inbound_evidence(evidence_type: EvidenceType, action: &str) -> Message {
        let mut details = MessageDetails::new(MessageDirection::GatewayToBackend);
        details.ref_to_message_id = Some("E1".to_string());
        details.action = Some(Action::new(action));
        Message::evidence(
            BusinessDomainId::default_lane(),
            details,
            MessageConfirmation::new(evidence_type, b"<ev/>".to_vec()),
        )
    }

    #[tokio::test]
    async fn test_delivery_trigger_twice_creates_one_confirmation() {
        let f = fixture(|_| {});
        let business = stored_business(&f.store, MessageDirection::GatewayToBackend).await;
        let lane = BusinessDomainId::default_lane();

        let mut outbox = Outbox::new();
        let msg = trigger(EvidenceType::Delivery, MessageDirection::BackendToGateway);
        f.processor.process_evidence_trigger(&lane, &msg, &mut outbox).await.unwrap();
        f.processor.process_evidence_trigger(&lane, &msg, &mut outbox).await.unwrap();

        let stored = f.store.get_message(&business.connector_message_id).await.unwrap().unwrap();
        let deliveries = stored
            .related_confirmations
            .iter()
            .filter(|c| c.evidence_type == EvidenceType::Delivery)
            .count();
        assert_eq!(deliveries, 1);
        assert!(stored.details.confirmed.is_some());

        assert_eq!(outbox.to_target(MessageTarget::Gateway).count(), 1);
        assert_eq!(outbox.to_target(MessageTarget::Backend).count(), 0);
        assert_eq!(outbox.cleanup, vec![business.connector_message_id]);
    }

    #[tokio::test]
    async fn test_generated_evidence_forwarded_to_backend() {
        let f = fixture(|c| c.tenants[0].evidence.send_generated_evidences_to_backend = true);
        stored_business(&f.store, MessageDirection::GatewayToBackend).await;

        let mut outbox = Outbox::new();
        f.processor
            .process_evidence_trigger(
                &BusinessDomainId::default_lane(),
                &trigger(EvidenceType::Delivery, MessageDirection::BackendToGateway),
                &mut outbox,
            )
            .await
            .unwrap();

        let to_backend: Vec<_> = outbox.to_target(MessageTarget::Backend).collect();
        assert_eq!(to_backend.len(), 1);
        assert_eq!(to_backend[0].link_partner_name, LinkPartnerName::new("backend-a"));
        assert_eq!(outbox.to_target(MessageTarget::Gateway).count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_from_gateway_is_illegal() {
        let f = fixture(|_| {});
        stored_business(&f.store, MessageDirection::BackendToGateway).await;

        let err = f
            .processor
            .process_evidence_trigger(
                &BusinessDomainId::default_lane(),
                &trigger(EvidenceType::Delivery, MessageDirection::GatewayToBackend),
                &mut Outbox::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::IllegalMessage { .. }));
    }

    #[tokio::test]
    async fn test_trigger_without_configured_action() {
        let f = fixture(|c| {
            let mut actions = HashMap::new();
            actions.insert(EvidenceType::Delivery, "Delivery".to_string());
            c.tenants[0].evidence.actions = Some(actions);
        });
        stored_business(&f.store, MessageDirection::GatewayToBackend).await;

        let err = f
            .processor
            .process_evidence_trigger(
                &BusinessDomainId::default_lane(),
                &trigger(EvidenceType::Retrieval, MessageDirection::BackendToGateway),
                &mut Outbox::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnknownEvidenceType { .. }));
    }

    #[tokio::test]
    async fn test_uncorrelated_trigger() {
        let f = fixture(|_| {});

        let err = f
            .processor
            .process_evidence_trigger(
                &BusinessDomainId::default_lane(),
                &trigger(EvidenceType::Delivery, MessageDirection::BackendToGateway),
                &mut Outbox::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::RelatedMessageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_inbound_evidence_forwarded_to_backend() {
        let f = fixture(|_| {});
        let business = stored_business(&f.store, MessageDirection::BackendToGateway).await;

        let mut outbox = Outbox::new();
        f.processor
            .process_evidence_message(
                &BusinessDomainId::default_lane(),
                &inbound_evidence(EvidenceType::NonDelivery, "DeliveryNonDeliveryToRecipient"),
                &mut outbox,
            )
            .await
            .unwrap();

        let stored = f.store.get_message(&business.connector_message_id).await.unwrap().unwrap();
        assert!(stored.details.rejected.is_some());

        let to_backend: Vec<_> = outbox.to_target(MessageTarget::Backend).collect();
        assert_eq!(to_backend.len(), 1);
        assert_eq!(to_backend[0].message.details.ref_to_message_id.as_deref(), Some("E1"));
        assert_eq!(outbox.to_target(MessageTarget::Gateway).count(), 0);
    }

    #[tokio::test]
    async fn test_lower_priority_evidence_not_forwarded() {
        let f = fixture(|_| {});
        stored_business(&f.store, MessageDirection::BackendToGateway).await;
        let lane = BusinessDomainId::default_lane();

        let mut outbox = Outbox::new();
        f.processor
            .process_evidence_message(
                &lane,
                &inbound_evidence(EvidenceType::Delivery, "DeliveryNonDeliveryToRecipient"),
                &mut outbox,
            )
            .await
            .unwrap();
        f.processor
            .process_evidence_message(
                &lane,
                &inbound_evidence(EvidenceType::RelayRemmdAcceptance, "RelayREMMDAcceptanceRejection"),
                &mut outbox,
            )
            .await
            .unwrap();

        assert_eq!(outbox.outbound.len(), 1);
    }

    #[tokio::test]
    async fn test_action_mismatch() {
        let lane = BusinessDomainId::default_lane();

        let lenient = fixture(|_| {});
        stored_business(&lenient.store, MessageDirection::BackendToGateway).await;
        lenient
            .processor
            .process_evidence_message(&lane, &inbound_evidence(EvidenceType::Delivery, "Wrong"), &mut Outbox::new())
            .await
            .unwrap();

        let strict = fixture(|c| c.tenants[0].evidence.enforce_action_names = true);
        stored_business(&strict.store, MessageDirection::BackendToGateway).await;
        let err = strict
            .processor
            .process_evidence_message(&lane, &inbound_evidence(EvidenceType::Delivery, "Wrong"), &mut Outbox::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::IllegalMessage { .. }));
    }
}
