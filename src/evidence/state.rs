//! Confirmed/rejected bookkeeping of business messages.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{Message, MessageConfirmation};
use crate::error::{ConnectorError, Result};
use crate::storage::Storage;

/// Why an evidence does not change the state of its business message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotRelevant {
    /// A confirmation of the same type is already related
    Duplicate,
    /// Evidence of a higher priority was already received
    LowerPriority { highest: u8 },
    /// Positive evidence for a message that is already rejected
    AlreadyRejected,
}

impl fmt::Display for NotRelevant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotRelevant::Duplicate => f.write_str("evidence ignored, duplicate"),
            NotRelevant::LowerPriority { highest } => {
                write!(f, "evidence ignored, higher priority {} already received", highest)
            }
            NotRelevant::AlreadyRejected => f.write_str("evidence ignored, message already rejected"),
        }
    }
}

/// Result of relating a confirmation to a business message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Stored without a state change (e.g. an acceptance)
    Recorded,
    Confirmed,
    Rejected,
    NotRelevant(NotRelevant),
}

impl ConfirmationOutcome {
    pub fn is_relevant(&self) -> bool {
        !matches!(self, ConfirmationOutcome::NotRelevant(_))
    }
}

/// Relates confirmations to business messages and derives the
/// confirmed/rejected state from evidence priority.
pub struct ConfirmationRecorder {
    storage: Arc<dyn Storage>,
}

impl ConfirmationRecorder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        ConfirmationRecorder { storage }
    }

    /// Store `confirmation` for `business` and update its state.
    ///
    /// `business` is updated in place so later steps of the same unit of
    /// work see the new state.
    pub async fn process_confirmation_for_message(
        &self,
        business: &mut Message,
        confirmation: &MessageConfirmation,
    ) -> Result<ConfirmationOutcome> {
        if !business.is_business_message() {
            return Err(ConnectorError::illegal_message(
                &business.connector_message_id,
                "confirmations can only be related to business messages",
            ));
        }

        let evidence_type = confirmation.evidence_type;
        if business.has_related_confirmation(evidence_type) {
            debug!(
                connector_message_id = %business.connector_message_id,
                evidence_type = %evidence_type,
                "Confirmation already related"
            );
            return Ok(ConfirmationOutcome::NotRelevant(NotRelevant::Duplicate));
        }

        self.storage
            .add_related_confirmation(&business.connector_message_id, confirmation)
            .await?;
        business.related_confirmations.push(confirmation.clone());

        self.confirm_reject_message(business, confirmation).await
    }

    /// Relate every confirmation a business message brought with it.
    pub async fn process_transported_confirmations(
        &self,
        business: &mut Message,
    ) -> Result<Vec<ConfirmationOutcome>> {
        let transported = business.transported_confirmations.clone();
        let mut outcomes = Vec::with_capacity(transported.len());
        for confirmation in &transported {
            let outcome = self.process_confirmation_for_message(business, confirmation).await?;
            if let ConfirmationOutcome::NotRelevant(reason) = outcome {
                info!(
                    connector_message_id = %business.connector_message_id,
                    evidence_type = %confirmation.evidence_type,
                    "Transported confirmation not relevant: {}",
                    reason
                );
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn confirm_reject_message(
        &self,
        business: &mut Message,
        confirmation: &MessageConfirmation,
    ) -> Result<ConfirmationOutcome> {
        let evidence_type = confirmation.evidence_type;
        let highest = business.highest_evidence_priority();

        if evidence_type.priority() < highest {
            info!(
                connector_message_id = %business.connector_message_id,
                evidence_type = %evidence_type,
                highest_priority = highest,
                "Evidence does not influence the confirmed or rejected state"
            );
            return Ok(ConfirmationOutcome::NotRelevant(NotRelevant::LowerPriority { highest }));
        }

        let now = Utc::now();
        let id = &business.connector_message_id;

        if evidence_type.is_negative() {
            self.storage.reject_message(id, now).await?;
            business.details.rejected = Some(now);
            warn!(
                connector_message_id = %id,
                evidence_type = %evidence_type,
                "Message has been rejected by evidence"
            );
            return Ok(ConfirmationOutcome::Rejected);
        }

        if evidence_type.is_confirming() {
            if business.details.rejected.is_some() {
                debug!(
                    connector_message_id = %id,
                    evidence_type = %evidence_type,
                    "Message already rejected, positive evidence ignored"
                );
                return Ok(ConfirmationOutcome::NotRelevant(NotRelevant::AlreadyRejected));
            }
            self.storage.confirm_message(id, now).await?;
            business.details.confirmed = Some(now);
            info!(
                connector_message_id = %id,
                evidence_type = %evidence_type,
                "Message is confirmed by evidence"
            );
            return Ok(ConfirmationOutcome::Confirmed);
        }

        Ok(ConfirmationOutcome::Recorded)
    }
}
