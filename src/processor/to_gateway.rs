use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{BusinessDomainId, EvidenceType, Message, RejectionReason};
use crate::error::{ConnectorError, Result};
use crate::evidence::{ConfirmationCreator, ConfirmationRecorder};
use crate::observability::MetricsRegistry;
use crate::storage::Storage;

use super::outbox::Outbox;
use super::submit::{EvidenceRoute, LinkSubmitter};

/// Business messages from a backend, bound for the gateway.
///
/// The message is accepted with a SUBMISSION_ACCEPTANCE that travels with
/// it and is also returned to the backend. If the evidence toolkit fails
/// the message is rejected with a SUBMISSION_REJECTION instead.
pub struct ToGatewayProcessor {
    storage: Arc<dyn Storage>,
    confirmations: Arc<ConfirmationCreator>,
    recorder: Arc<ConfirmationRecorder>,
    submitter: Arc<LinkSubmitter>,
    metrics: Arc<MetricsRegistry>,
}

impl ToGatewayProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        confirmations: Arc<ConfirmationCreator>,
        recorder: Arc<ConfirmationRecorder>,
        submitter: Arc<LinkSubmitter>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        ToGatewayProcessor {
            storage,
            confirmations,
            recorder,
            submitter,
            metrics,
        }
    }

    pub async fn process(&self, tenant: &BusinessDomainId, mut message: Message, outbox: &mut Outbox) -> Result<()> {
        let gateway = self.submitter.gateway_name(tenant, &message)?;
        message.details.gateway_name = Some(gateway);
        if message
            .details
            .ebms_message_id
            .as_deref()
            .map_or(true, str::is_empty)
        {
            message.details.ebms_message_id = Some(generate_ebms_id(tenant));
        }
        self.storage.persist_message(&message).await?;

        match self.accept(tenant, &mut message, outbox).await {
            Err(ConnectorError::EvidenceToolkit(reason)) => {
                self.reject(tenant, message, reason, outbox).await
            }
            other => other,
        }
    }

    async fn accept(&self, tenant: &BusinessDomainId, message: &mut Message, outbox: &mut Outbox) -> Result<()> {
        let confirmation = self
            .confirmations
            .create_confirmation(EvidenceType::SubmissionAcceptance, message, None, None)
            .await?;
        self.metrics.record_evidence_created();

        let outcome = self
            .recorder
            .process_confirmation_for_message(message, &confirmation)
            .await?;
        self.metrics.record_confirmation(&outcome);

        message.transported_confirmations.push(confirmation.clone());
        self.storage.persist_message(message).await?;

        info!(
            tenant = %tenant,
            connector_message_id = %message.connector_message_id,
            ebms_message_id = ?message.details.ebms_message_id,
            "Business message accepted for the gateway"
        );

        self.submitter.submit(tenant, message.clone(), outbox).await?;
        self.submitter
            .submit_confirmation(tenant, None, message, &confirmation, EvidenceRoute::Opposite, outbox)
            .await?;
        Ok(())
    }

    /// Reject the message with a SUBMISSION_REJECTION. If that evidence
    /// cannot be created either, the toolkit error is returned.
    async fn reject(
        &self,
        tenant: &BusinessDomainId,
        mut message: Message,
        reason: String,
        outbox: &mut Outbox,
    ) -> Result<()> {
        warn!(
            tenant = %tenant,
            connector_message_id = %message.connector_message_id,
            error = %reason,
            "Submission acceptance failed, rejecting message"
        );

        let confirmation = match self
            .confirmations
            .create_confirmation(
                EvidenceType::SubmissionRejection,
                &message,
                Some(RejectionReason::Other),
                Some(&reason),
            )
            .await
        {
            Ok(confirmation) => confirmation,
            Err(_) => return Err(ConnectorError::EvidenceToolkit(reason)),
        };
        self.metrics.record_evidence_created();

        let outcome = self
            .recorder
            .process_confirmation_for_message(&mut message, &confirmation)
            .await?;
        self.metrics.record_confirmation(&outcome);

        outbox.cleanup(message.connector_message_id.clone());
        self.submitter
            .submit_confirmation(tenant, None, &message, &confirmation, EvidenceRoute::Opposite, outbox)
            .await?;
        Ok(())
    }
}

fn generate_ebms_id(tenant: &BusinessDomainId) -> String {
    format!("{}@{}.lanebridge", Uuid::new_v4(), tenant)
}
