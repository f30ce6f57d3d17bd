use axum::http::StatusCode;
use serde::Serialize;

use crate::domain::{LinkPartnerName, TransportId};
use crate::error::ConnectorError;
use crate::routing::RoutingRule;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub config_version: String,
    pub uptime_secs: u64,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub config_version: String,
    pub tenants: usize,
    pub link_partners: Vec<LinkPartnerName>,
}

/// Routing rules of a tenant in evaluation order.
#[derive(Debug, Serialize)]
pub struct RoutingRulesResponse {
    pub tenant: String,
    pub default_backend: LinkPartnerName,
    pub rules: Vec<RoutingRule>,
}

/// Outcome of a rule expression dry run.
#[derive(Debug, Serialize)]
pub struct ValidateExpressionResponse {
    pub valid: bool,

    /// Canonical form of the expression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the given message details match, if details were given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<bool>,
}

/// Message accepted into the inbound queue.
#[derive(Debug, Serialize)]
pub struct SubmitMessageResponse {
    pub connector_message_id: String,
}

/// Status report recorded on a transport step.
#[derive(Debug, Serialize)]
pub struct StatusRecordedResponse {
    pub transport_id: TransportId,

    /// New attempt scheduled because the transport failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_transport_id: Option<TransportId>,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.into(),
            code: code.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "BAD_REQUEST")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "NOT_FOUND")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "INTERNAL_ERROR")
    }

    /// Status code and body for a connector error.
    pub fn from_error(err: &ConnectorError) -> (StatusCode, Self) {
        match err {
            ConnectorError::UnknownBusinessDomain(_) | ConnectorError::TransportStepNotFound(_) => {
                (StatusCode::NOT_FOUND, ErrorResponse::not_found(err.to_string()))
            }
            ConnectorError::MalformedExpression(_) | ConnectorError::IllegalMessage { .. } => {
                (StatusCode::BAD_REQUEST, ErrorResponse::bad_request(err.to_string()))
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::internal_error(err.to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BusinessDomainId;

    #[test]
    fn test_error_mapping() {
        let (status, body) =
            ErrorResponse::from_error(&ConnectorError::UnknownBusinessDomain(BusinessDomainId::new("lane9")));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "NOT_FOUND");
        assert!(body.error.contains("lane9"));

        let (status, _) = ErrorResponse::from_error(&ConnectorError::Queue("closed".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validate_response_skips_empty_fields() {
        let resp = ValidateExpressionResponse {
            valid: false,
            expression: None,
            error: Some("unbalanced parentheses".to_string()),
            matches: None,
        };

        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("unbalanced"));
        assert!(!json.contains("matches"));
    }
}
