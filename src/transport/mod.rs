//! Transport lifecycle of messages handed to link partners.

use ahash::AHashMap;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    ConnectorMessageId, LinkPartnerName, Message, MessageTarget, StatusUpdate, TransportId, TransportState,
    TransportStatusUpdate, TransportStep,
};
use crate::error::{ConnectorError, Result};
use crate::observability::MetricsRegistry;
use crate::storage::{MessageErrorRecord, Storage};

/// Records transport attempts and their status reports.
pub struct TransportStateService {
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsRegistry>,
}

impl TransportStateService {
    pub fn new(storage: Arc<dyn Storage>, metrics: Arc<MetricsRegistry>) -> Self {
        TransportStateService { storage, metrics }
    }

    /// Create the next transport attempt of `message` over `link`, starting
    /// in PENDING.
    pub async fn create_transport_for(
        &self,
        message: &Message,
        link: &LinkPartnerName,
    ) -> Result<TransportId> {
        let attempt = self
            .storage
            .highest_attempt(&message.connector_message_id, link)
            .await?
            + 1;

        let mut step = TransportStep::new(message, link.clone(), attempt);
        step.add_status(StatusUpdate::new(TransportState::Pending));
        self.storage.create_transport_step(&step).await?;
        self.metrics.record_transport_step_created();

        debug!(
            connector_message_id = %message.connector_message_id,
            link = %link,
            transport_id = %step.transport_id,
            attempt = attempt,
            "Created transport step"
        );
        Ok(step.transport_id)
    }

    /// Record a status report. The success handling follows the direction
    /// of the transported message.
    ///
    /// Returns true when the report moved the step into its first final
    /// state; reports after that are only added to the history.
    pub async fn update_transport_status(
        &self,
        transport_id: &TransportId,
        update: TransportStatusUpdate,
    ) -> Result<bool> {
        let step = self.load_step(transport_id).await?;
        let target = step
            .transported_message
            .as_ref()
            .map(|m| m.direction().target());
        self.apply(step, update, target).await
    }

    /// Record a status report of a transport to the gateway.
    pub async fn update_transport_to_gateway_status(
        &self,
        transport_id: &TransportId,
        update: TransportStatusUpdate,
    ) -> Result<bool> {
        let step = self.load_step(transport_id).await?;
        self.apply(step, update, Some(MessageTarget::Gateway)).await
    }

    /// Record a status report of a transport to a backend.
    pub async fn update_transport_to_backend_status(
        &self,
        transport_id: &TransportId,
        update: TransportStatusUpdate,
    ) -> Result<bool> {
        let step = self.load_step(transport_id).await?;
        self.apply(step, update, Some(MessageTarget::Backend)).await
    }

    /// Whether a failed transport may be attempted again.
    ///
    /// Not eligible: steps without a readable message, accepted steps and
    /// business messages that already reached a confirmed or rejected state.
    pub async fn is_retry_eligible(&self, step: &TransportStep) -> bool {
        let Some(message) = &step.transported_message else {
            return false;
        };
        if step.is_in_state(TransportState::Accepted) {
            return false;
        }
        if !message.is_business_message() {
            return true;
        }

        match self.storage.get_message(&message.connector_message_id).await {
            Ok(Some(stored)) => !stored.details.is_confirmed_or_rejected(),
            Ok(None) => !message.details.is_confirmed_or_rejected(),
            Err(e) => {
                warn!(
                    transport_id = %step.transport_id,
                    error = %e,
                    "Could not read message state, not retrying"
                );
                false
            }
        }
    }

    /// Latest attempts of `link` that are still PENDING, oldest first.
    pub async fn pending_steps_for(&self, link: &LinkPartnerName) -> Result<Vec<TransportStep>> {
        let open = self.storage.open_transport_steps(link).await?;

        let mut latest: AHashMap<_, TransportStep> = AHashMap::new();
        for step in open {
            let newer = latest
                .get(&step.connector_message_id)
                .map(|s| step.attempt > s.attempt)
                .unwrap_or(true);
            if newer {
                latest.insert(step.connector_message_id.clone(), step);
            }
        }

        let mut pending: Vec<TransportStep> = latest.into_values().filter(|s| s.is_pending()).collect();
        pending.sort_by_key(|s| s.created);
        Ok(pending)
    }

    pub async fn get_transport_step(&self, transport_id: &TransportId) -> Result<Option<TransportStep>> {
        Ok(self.storage.get_transport_step(transport_id).await?)
    }

    /// Number of attempts made for `message_id` over `link` so far.
    pub async fn attempts_made(&self, message_id: &ConnectorMessageId, link: &LinkPartnerName) -> Result<u32> {
        Ok(self.storage.highest_attempt(message_id, link).await?)
    }

    async fn load_step(&self, transport_id: &TransportId) -> Result<TransportStep> {
        self.storage
            .get_transport_step(transport_id)
            .await?
            .ok_or_else(|| ConnectorError::TransportStepNotFound(transport_id.clone()))
    }

    async fn apply(
        &self,
        mut step: TransportStep,
        update: TransportStatusUpdate,
        target: Option<MessageTarget>,
    ) -> Result<bool> {
        step.fix_remote_message_id(update.remote_message_id.as_deref());
        step.fix_transport_system_message_id(update.transport_impl_id.as_deref());

        let mut status = StatusUpdate::new(update.state);
        status.text = update.text.clone();
        let first_final = step.add_status(status);

        self.storage.update_transport_step(&step).await?;
        self.metrics.record_transport_update(update.state);

        if update.state.is_final() && !first_final {
            warn!(
                transport_id = %step.transport_id,
                state = %update.state,
                effective_state = ?step.state(),
                "Transport already reached a final state, status only recorded"
            );
            return Ok(false);
        }

        let Some(message) = step.transported_message.as_ref() else {
            debug!(transport_id = %step.transport_id, "No transported message, status only recorded");
            return Ok(first_final);
        };

        match update.state {
            TransportState::Accepted => {
                if let Some(target) = target {
                    self.on_accepted(&step, message, target).await?;
                }
            }
            TransportState::Failed => {
                for error in &update.errors {
                    self.storage
                        .persist_message_error(&MessageErrorRecord {
                            transport_id: step.transport_id.clone(),
                            connector_message_id: step.connector_message_id.clone(),
                            error: error.clone(),
                            created: Utc::now(),
                        })
                        .await?;
                }
                warn!(
                    transport_id = %step.transport_id,
                    link = %step.link_partner_name,
                    errors = update.errors.len(),
                    "Transport failed"
                );
            }
            TransportState::Pending | TransportState::PendingDownloaded => {}
        }

        Ok(first_final)
    }

    async fn on_accepted(&self, step: &TransportStep, message: &Message, target: MessageTarget) -> Result<()> {
        let now = Utc::now();

        if message.is_business_message() {
            let id = &message.connector_message_id;
            if let Some(remote_id) = step.remote_message_id.as_deref() {
                self.storage.set_remote_message_id(id, target, remote_id).await?;
            }
            self.storage.set_delivered(id, target, now).await?;

            for confirmation in &message.transported_confirmations {
                self.mark_transported(id, confirmation.evidence_type, target, step).await;
            }

            info!(
                connector_message_id = %id,
                transport_id = %step.transport_id,
                link = %step.link_partner_name,
                remote_message_id = ?step.remote_message_id,
                "Message delivered to {:?}",
                target
            );
        } else if let (Some(business_id), Some(evidence_type)) =
            (message.details.caused_by.as_ref(), message.evidence_type())
        {
            self.mark_transported(business_id, evidence_type, target, step).await;
        }

        Ok(())
    }

    async fn mark_transported(
        &self,
        business_id: &ConnectorMessageId,
        evidence_type: crate::domain::EvidenceType,
        target: MessageTarget,
        step: &TransportStep,
    ) {
        if let Err(e) = self
            .storage
            .set_confirmation_transported(business_id, evidence_type, target, Utc::now())
            .await
        {
            warn!(
                connector_message_id = %business_id,
                transport_id = %step.transport_id,
                evidence_type = %evidence_type,
                error = %e,
                "Could not mark confirmation as transported"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BusinessDomainId, EvidenceType, MessageConfirmation, MessageContent, MessageDetails,
        MessageDirection, MessageError,
    };
    use crate::storage::MemoryStore;

    fn setup() -> (TransportStateService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = TransportStateService::new(store.clone(), Arc::new(MetricsRegistry::new()));
        (service, store)
    }

    fn outgoing() -> Message {
        let mut msg = Message::business(
            BusinessDomainId::default_lane(),
            MessageDetails::new(MessageDirection::BackendToGateway),
            MessageContent::new("doc.xml", b"<doc/>".to_vec()),
        );
        msg.transported_confirmations
            .push(MessageConfirmation::new(EvidenceType::SubmissionAcceptance, vec![1]));
        msg.related_confirmations
            .push(MessageConfirmation::new(EvidenceType::SubmissionAcceptance, vec![1]));
        msg
    }

    #[tokio::test]
    async fn test_attempts_increase_per_link() {
        let (service, _) = setup();
        let msg = outgoing();
        let gw = LinkPartnerName::new("gw");

        let first = service.create_transport_for(&msg, &gw).await.unwrap();
        let second = service.create_transport_for(&msg, &gw).await.unwrap();
        let other = service
            .create_transport_for(&msg, &LinkPartnerName::new("gw2"))
            .await
            .unwrap();

        assert_eq!(first.as_str(), format!("{}_gw_1", msg.connector_message_id));
        assert_eq!(second.as_str(), format!("{}_gw_2", msg.connector_message_id));
        assert!(other.as_str().ends_with("_gw2_1"));
    }

    #[tokio::test]
    async fn test_accepted_marks_message_delivered() {
        let (service, store) = setup();
        let msg = outgoing();
        store.persist_message(&msg).await.unwrap();
        let id = service.create_transport_for(&msg, &LinkPartnerName::new("gw")).await.unwrap();

        service
            .update_transport_status(&id, TransportStatusUpdate::new(TransportState::Pending))
            .await
            .unwrap();
        let mut accepted = TransportStatusUpdate::accepted("ebms-42");
        accepted.transport_impl_id = Some("jms-1".to_string());
        service.update_transport_status(&id, accepted).await.unwrap();

        let step = service.get_transport_step(&id).await.unwrap().unwrap();
        assert_eq!(step.state(), Some(TransportState::Accepted));
        assert_eq!(step.remote_message_id.as_deref(), Some("ebms-42"));
        assert_eq!(step.transport_system_message_id.as_deref(), Some("jms-1"));
        assert!(step.final_state_reached.is_some());

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        assert_eq!(stored.details.ebms_message_id.as_deref(), Some("ebms-42"));
        assert!(stored.details.delivered_to_gateway.is_some());
        assert!(stored.related_confirmations[0].transported_to_gateway.is_some());
    }

    #[tokio::test]
    async fn test_later_final_state_has_no_effect() {
        let (service, store) = setup();
        let msg = outgoing();
        store.persist_message(&msg).await.unwrap();
        let id = service.create_transport_for(&msg, &LinkPartnerName::new("gw")).await.unwrap();

        let first = service
            .update_transport_status(&id, TransportStatusUpdate::accepted("ebms-1"))
            .await
            .unwrap();
        let late = service
            .update_transport_status(
                &id,
                TransportStatusUpdate::failed(vec![MessageError::new("gw", "late failure")]),
            )
            .await
            .unwrap();
        assert!(first);
        assert!(!late);

        let step = service.get_transport_step(&id).await.unwrap().unwrap();
        assert_eq!(step.status_history.len(), 3);
        assert_eq!(step.state(), Some(TransportState::Accepted));
        assert!(store.message_errors(&msg.connector_message_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_persists_errors() {
        let (service, store) = setup();
        let msg = outgoing();
        store.persist_message(&msg).await.unwrap();
        let id = service.create_transport_for(&msg, &LinkPartnerName::new("gw")).await.unwrap();

        service
            .update_transport_status(
                &id,
                TransportStatusUpdate::failed(vec![
                    MessageError::new("gw", "connection refused"),
                    MessageError::new("gw", "retry later"),
                ]),
            )
            .await
            .unwrap();

        let errors = store.message_errors(&msg.connector_message_id).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.transport_id == id));

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        assert!(stored.details.delivered_to_gateway.is_none());
    }

    #[tokio::test]
    async fn test_confirmation_marking_failure_is_swallowed() {
        let (service, store) = setup();
        let msg = outgoing();
        store.persist_message(&msg).await.unwrap();
        let id = service.create_transport_for(&msg, &LinkPartnerName::new("gw")).await.unwrap();
        store.fail_on("set_confirmation_transported");

        service
            .update_transport_status(&id, TransportStatusUpdate::accepted("ebms-1"))
            .await
            .unwrap();

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        assert!(stored.details.delivered_to_gateway.is_some());
        assert!(stored.related_confirmations[0].transported_to_gateway.is_none());
    }

    #[tokio::test]
    async fn test_unknown_transport() {
        let (service, _) = setup();
        let err = service
            .update_transport_status(
                &TransportId::new("nope_gw_1"),
                TransportStatusUpdate::new(TransportState::Pending),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::TransportStepNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_snapshot_records_history_only() {
        let (service, store) = setup();
        let msg = outgoing();
        let mut step = TransportStep::new(&msg, LinkPartnerName::new("gw"), 1);
        step.transported_message = None;
        store.create_transport_step(&step).await.unwrap();

        service
            .update_transport_status(&step.transport_id, TransportStatusUpdate::accepted("ebms-1"))
            .await
            .unwrap();

        let stored = store.get_transport_step(&step.transport_id).await.unwrap().unwrap();
        assert_eq!(stored.state(), Some(TransportState::Accepted));
        assert!(store.get_message(&msg.connector_message_id).await.unwrap().is_none());
        assert!(!service.is_retry_eligible(&stored).await);
    }

    #[tokio::test]
    async fn test_backend_wrapper_stores_backend_id() {
        let (service, store) = setup();
        let mut msg = outgoing();
        msg.details.direction = MessageDirection::GatewayToBackend;
        store.persist_message(&msg).await.unwrap();
        let id = service
            .create_transport_for(&msg, &LinkPartnerName::new("backend"))
            .await
            .unwrap();

        service
            .update_transport_to_backend_status(&id, TransportStatusUpdate::accepted("bk-7"))
            .await
            .unwrap();

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        assert_eq!(stored.details.backend_message_id.as_deref(), Some("bk-7"));
        assert!(stored.details.delivered_to_backend.is_some());
    }

    #[tokio::test]
    async fn test_retry_eligibility() {
        let (service, store) = setup();
        let msg = outgoing();
        store.persist_message(&msg).await.unwrap();
        let gw = LinkPartnerName::new("gw");
        let id = service.create_transport_for(&msg, &gw).await.unwrap();
        service
            .update_transport_status(&id, TransportStatusUpdate::failed(Vec::new()))
            .await
            .unwrap();

        let step = service.get_transport_step(&id).await.unwrap().unwrap();
        assert!(service.is_retry_eligible(&step).await);

        store.reject_message(&msg.connector_message_id, Utc::now()).await.unwrap();
        assert!(!service.is_retry_eligible(&step).await);
    }

    #[tokio::test]
    async fn test_pending_steps_latest_attempt_only() {
        let (service, _) = setup();
        let gw = LinkPartnerName::new("gw");
        let a = outgoing();
        let b = outgoing();

        let a1 = service.create_transport_for(&a, &gw).await.unwrap();
        service
            .update_transport_status(&a1, TransportStatusUpdate::new(TransportState::Pending))
            .await
            .unwrap();
        let a2 = service.create_transport_for(&a, &gw).await.unwrap();
        service
            .update_transport_status(&a2, TransportStatusUpdate::new(TransportState::Pending))
            .await
            .unwrap();

        let b1 = service.create_transport_for(&b, &gw).await.unwrap();
        service
            .update_transport_status(&b1, TransportStatusUpdate::new(TransportState::PendingDownloaded))
            .await
            .unwrap();

        let pending = service.pending_steps_for(&gw).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transport_id, a2);
    }
}
