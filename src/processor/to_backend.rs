use std::sync::Arc;
use tracing::info;

use crate::domain::{BusinessDomainId, EvidenceType, Message};
use crate::error::Result;
use crate::evidence::{ConfirmationCreator, ConfirmationRecorder};
use crate::observability::MetricsRegistry;
use crate::routing::RoutingRuleRegistry;
use crate::storage::Storage;

use super::outbox::Outbox;
use super::submit::{EvidenceRoute, LinkSubmitter};

/// Business messages from the gateway, bound for a backend.
///
/// The confirmations the message brought along are related to it, a
/// RELAY_REMMD_ACCEPTANCE goes back to the gateway and the message is
/// handed to the backend the routing rules select.
pub struct ToBackendProcessor {
    storage: Arc<dyn Storage>,
    routing: Arc<RoutingRuleRegistry>,
    confirmations: Arc<ConfirmationCreator>,
    recorder: Arc<ConfirmationRecorder>,
    submitter: Arc<LinkSubmitter>,
    metrics: Arc<MetricsRegistry>,
}

impl ToBackendProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        routing: Arc<RoutingRuleRegistry>,
        confirmations: Arc<ConfirmationCreator>,
        recorder: Arc<ConfirmationRecorder>,
        submitter: Arc<LinkSubmitter>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        ToBackendProcessor {
            storage,
            routing,
            confirmations,
            recorder,
            submitter,
            metrics,
        }
    }

    pub async fn process(&self, tenant: &BusinessDomainId, mut message: Message, outbox: &mut Outbox) -> Result<()> {
        let backend = self.routing.lookup_backend_name(tenant, &message).await?;
        message.details.backend_name = Some(backend.clone());
        self.storage.persist_message(&message).await?;

        for outcome in self.recorder.process_transported_confirmations(&mut message).await? {
            self.metrics.record_confirmation(&outcome);
        }

        let relay = self
            .confirmations
            .create_confirmation(EvidenceType::RelayRemmdAcceptance, &message, None, None)
            .await?;
        self.metrics.record_evidence_created();
        let outcome = self.recorder.process_confirmation_for_message(&mut message, &relay).await?;
        self.metrics.record_confirmation(&outcome);

        info!(
            tenant = %tenant,
            connector_message_id = %message.connector_message_id,
            ebms_message_id = ?message.details.ebms_message_id,
            link = %backend,
            "Business message received from the gateway"
        );

        self.submitter
            .submit_confirmation(tenant, None, &message, &relay, EvidenceRoute::Opposite, outbox)
            .await?;
        self.submitter.submit(tenant, message, outbox).await?;
        Ok(())
    }
}
