use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{
    BusinessDomainId, ConnectorMessageId, EvidenceType, MessageDirection, TransportId,
};
use crate::routing::MalformedExpression;

/// Errors raised while processing a unit of work.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error(transparent)]
    MalformedExpression(#[from] MalformedExpression),

    #[error(
        "No business message found for refToMessageId [{ref_to_message_id:?}] / \
         refToBackendMessageId [{ref_to_backend_message_id:?}] in direction {direction}"
    )]
    RelatedMessageNotFound {
        ref_to_message_id: Option<String>,
        ref_to_backend_message_id: Option<String>,
        direction: MessageDirection,
    },

    #[error("No action configured for evidence type {evidence_type} in business domain {tenant}")]
    UnknownEvidenceType {
        evidence_type: EvidenceType,
        tenant: BusinessDomainId,
    },

    #[error("No transport step found with transport id [{0}]")]
    TransportStepNotFound(TransportId),

    #[error("Business domain [{0}] is not configured")]
    UnknownBusinessDomain(BusinessDomainId),

    #[error("Illegal message [{message_id}]: {reason}")]
    IllegalMessage {
        message_id: ConnectorMessageId,
        reason: String,
    },

    #[error("Evidence toolkit error: {0}")]
    EvidenceToolkit(String),

    #[error("No business domain set for the current unit of work")]
    NoCurrentBusinessDomain,

    #[error("Queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ConnectorError {
    pub fn illegal_message(message_id: &ConnectorMessageId, reason: impl Into<String>) -> Self {
        ConnectorError::IllegalMessage {
            message_id: message_id.clone(),
            reason: reason.into(),
        }
    }

    /// Whether redelivering the message can succeed.
    ///
    /// Correlation and configuration failures go to the dead letter queue
    /// straight away instead of looping.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Storage(_) | ConnectorError::Queue(_) | ConnectorError::EvidenceToolkit(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let not_found = ConnectorError::RelatedMessageNotFound {
            ref_to_message_id: Some("E1".to_string()),
            ref_to_backend_message_id: None,
            direction: MessageDirection::GatewayToBackend,
        };
        assert!(!not_found.is_retryable());
        assert!(not_found.to_string().contains("E1"));

        let storage = ConnectorError::Storage(anyhow::anyhow!("connection reset"));
        assert!(storage.is_retryable());
    }

    #[test]
    fn test_unknown_evidence_type_message() {
        let err = ConnectorError::UnknownEvidenceType {
            evidence_type: EvidenceType::Retrieval,
            tenant: BusinessDomainId::new("lane7"),
        };
        let text = err.to_string();
        assert!(text.contains("RETRIEVAL"));
        assert!(text.contains("lane7"));
    }
}
