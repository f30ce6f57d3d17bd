use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::EvidenceConfig;
use crate::domain::{
    Action, BusinessDomainId, EvidenceType, Message, MessageConfirmation, RejectionReason,
};
use crate::error::{ConnectorError, Result};
use crate::tenant::TenantRegistry;

/// Produces the evidence document for a business message.
///
/// Signing and the REM evidence format live behind this trait.
#[async_trait]
pub trait EvidenceToolkit: Send + Sync {
    async fn create_evidence(
        &self,
        evidence_type: EvidenceType,
        business_message: &Message,
        rejection_reason: Option<RejectionReason>,
        details: Option<&str>,
    ) -> Result<Vec<u8>>;
}

/// Toolkit writing an unsigned JSON evidence document.
#[derive(Debug, Default, Clone)]
pub struct UnsignedEvidenceToolkit;

#[async_trait]
impl EvidenceToolkit for UnsignedEvidenceToolkit {
    async fn create_evidence(
        &self,
        evidence_type: EvidenceType,
        business_message: &Message,
        rejection_reason: Option<RejectionReason>,
        details: Option<&str>,
    ) -> Result<Vec<u8>> {
        let d = &business_message.details;
        let document = serde_json::json!({
            "evidence_id": Uuid::new_v4().to_string(),
            "evidence_type": evidence_type,
            "event_time": Utc::now().to_rfc3339(),
            "connector_message_id": business_message.connector_message_id,
            "ebms_message_id": d.ebms_message_id,
            "backend_message_id": d.backend_message_id,
            "sender": d.from_party.as_ref().map(|p| p.party_id.as_str()),
            "recipient": d.to_party.as_ref().map(|p| p.party_id.as_str()),
            "original_sender": d.original_sender,
            "final_recipient": d.final_recipient,
            "rejection_reason": rejection_reason,
            "reason_text": rejection_reason.map(|r| r.reason_text()),
            "details": details,
        });

        serde_json::to_vec(&document).map_err(|e| ConnectorError::EvidenceToolkit(e.to_string()))
    }
}

/// Evidence type to AS4 action, built once per tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceActionTable {
    actions: [Option<Action>; 9],
}

impl EvidenceActionTable {
    /// The standard e-delivery actions.
    pub fn standard() -> Self {
        let mut table = EvidenceActionTable::empty();
        for evidence_type in EvidenceType::ALL {
            let action = match evidence_type {
                EvidenceType::SubmissionAcceptance | EvidenceType::SubmissionRejection => {
                    "SubmissionAcceptanceRejection"
                }
                EvidenceType::RelayRemmdAcceptance | EvidenceType::RelayRemmdRejection => {
                    "RelayREMMDAcceptanceRejection"
                }
                EvidenceType::RelayRemmdFailure => "RelayREMMDFailure",
                EvidenceType::Delivery | EvidenceType::NonDelivery => {
                    "DeliveryNonDeliveryToRecipient"
                }
                EvidenceType::Retrieval | EvidenceType::NonRetrieval => {
                    "RetrievalNonRetrievalToRecipient"
                }
            };
            table.set(evidence_type, Action::new(action));
        }
        table
    }

    pub fn empty() -> Self {
        EvidenceActionTable {
            actions: Default::default(),
        }
    }

    pub fn from_config(config: &EvidenceConfig) -> Self {
        match &config.actions {
            None => EvidenceActionTable::standard(),
            Some(actions) => {
                let mut table = EvidenceActionTable::empty();
                for (evidence_type, action) in actions {
                    table.set(*evidence_type, Action::new(action.clone()));
                }
                table
            }
        }
    }

    pub fn set(&mut self, evidence_type: EvidenceType, action: Action) {
        self.actions[evidence_type as usize] = Some(action);
    }

    pub fn action_for(&self, evidence_type: EvidenceType) -> Option<&Action> {
        self.actions[evidence_type as usize].as_ref()
    }
}

/// Creates confirmations through the toolkit and resolves evidence actions.
pub struct ConfirmationCreator {
    toolkit: Arc<dyn EvidenceToolkit>,
    tenants: Arc<TenantRegistry>,
}

impl ConfirmationCreator {
    pub fn new(toolkit: Arc<dyn EvidenceToolkit>, tenants: Arc<TenantRegistry>) -> Self {
        ConfirmationCreator { toolkit, tenants }
    }

    /// Action to put on an evidence message of `evidence_type`.
    pub fn create_evidence_action(
        &self,
        tenant: &BusinessDomainId,
        evidence_type: EvidenceType,
    ) -> Result<Action> {
        let state = self.tenants.get(tenant)?;
        state
            .evidence_actions
            .action_for(evidence_type)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownEvidenceType {
                evidence_type,
                tenant: tenant.clone(),
            })
    }

    pub async fn create_confirmation(
        &self,
        evidence_type: EvidenceType,
        business_message: &Message,
        rejection_reason: Option<RejectionReason>,
        details: Option<&str>,
    ) -> Result<MessageConfirmation> {
        let evidence = self
            .toolkit
            .create_evidence(evidence_type, business_message, rejection_reason, details)
            .await?;

        debug!(
            connector_message_id = %business_message.connector_message_id,
            evidence_type = %evidence_type,
            "Created evidence"
        );

        let confirmation = MessageConfirmation::new(evidence_type, evidence);
        Ok(match rejection_reason {
            Some(reason) => confirmation.with_rejection_reason(reason),
            None => confirmation,
        })
    }

    /// Negative evidence issued because a timeout elapsed.
    pub async fn create_timeout_confirmation(
        &self,
        evidence_type: EvidenceType,
        business_message: &Message,
        reason: RejectionReason,
    ) -> Result<MessageConfirmation> {
        self.create_confirmation(evidence_type, business_message, Some(reason), Some(reason.reason_text()))
            .await
    }
}
