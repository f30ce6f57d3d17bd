use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evidence types of the REM evidence model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceType {
    SubmissionAcceptance,
    SubmissionRejection,
    RelayRemmdAcceptance,
    RelayRemmdFailure,
    RelayRemmdRejection,
    Delivery,
    NonDelivery,
    Retrieval,
    NonRetrieval,
}

impl EvidenceType {
    pub const ALL: [EvidenceType; 9] = [
        EvidenceType::SubmissionAcceptance,
        EvidenceType::SubmissionRejection,
        EvidenceType::RelayRemmdAcceptance,
        EvidenceType::RelayRemmdFailure,
        EvidenceType::RelayRemmdRejection,
        EvidenceType::Delivery,
        EvidenceType::NonDelivery,
        EvidenceType::Retrieval,
        EvidenceType::NonRetrieval,
    ];

    /// Position in the evidence chain.
    ///
    /// Evidence of a lower priority than the highest evidence already
    /// related to a message cannot change its confirmed/rejected state.
    pub fn priority(&self) -> u8 {
        match self {
            EvidenceType::SubmissionAcceptance | EvidenceType::SubmissionRejection => 1,
            EvidenceType::RelayRemmdAcceptance
            | EvidenceType::RelayRemmdFailure
            | EvidenceType::RelayRemmdRejection => 2,
            EvidenceType::Delivery | EvidenceType::NonDelivery => 3,
            EvidenceType::Retrieval | EvidenceType::NonRetrieval => 4,
        }
    }

    /// Evidence that rejects the business message.
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            EvidenceType::SubmissionRejection
                | EvidenceType::NonDelivery
                | EvidenceType::NonRetrieval
                | EvidenceType::RelayRemmdRejection
                | EvidenceType::RelayRemmdFailure
        )
    }

    /// Evidence that confirms the business message.
    pub fn is_confirming(&self) -> bool {
        matches!(self, EvidenceType::Delivery | EvidenceType::Retrieval)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::SubmissionAcceptance => "SUBMISSION_ACCEPTANCE",
            EvidenceType::SubmissionRejection => "SUBMISSION_REJECTION",
            EvidenceType::RelayRemmdAcceptance => "RELAY_REMMD_ACCEPTANCE",
            EvidenceType::RelayRemmdFailure => "RELAY_REMMD_FAILURE",
            EvidenceType::RelayRemmdRejection => "RELAY_REMMD_REJECTION",
            EvidenceType::Delivery => "DELIVERY",
            EvidenceType::NonDelivery => "NON_DELIVERY",
            EvidenceType::Retrieval => "RETRIEVAL",
            EvidenceType::NonRetrieval => "NON_RETRIEVAL",
        }
    }

    /// Parse from string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        let upper = s.to_uppercase();
        EvidenceType::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
    }
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a negative evidence was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    Other,
    DeliveryEvidenceTimeout,
    RelayEvidenceTimeout,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Other => "OTHER",
            RejectionReason::DeliveryEvidenceTimeout => "DELIVERY_EVIDENCE_TIMEOUT",
            RejectionReason::RelayEvidenceTimeout => "RELAY_EVIDENCE_TIMEOUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OTHER" => Some(RejectionReason::Other),
            "DELIVERY_EVIDENCE_TIMEOUT" => Some(RejectionReason::DeliveryEvidenceTimeout),
            "RELAY_EVIDENCE_TIMEOUT" => Some(RejectionReason::RelayEvidenceTimeout),
            _ => None,
        }
    }

    pub fn reason_text(&self) -> &'static str {
        match self {
            RejectionReason::Other => "Other",
            RejectionReason::DeliveryEvidenceTimeout => {
                "There was no delivery evidence received in time"
            }
            RejectionReason::RelayEvidenceTimeout => {
                "There was no relay evidence received in time"
            }
        }
    }
}

/// An evidence attached to (or transported with) a message.
///
/// The evidence payload is produced by the evidence toolkit and is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfirmation {
    pub evidence_type: EvidenceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,

    #[serde(default)]
    pub evidence: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transported_to_gateway: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transported_to_backend: Option<DateTime<Utc>>,
}

impl MessageConfirmation {
    /// Create a confirmation carrying a generated evidence payload.
    pub fn new(evidence_type: EvidenceType, evidence: Vec<u8>) -> Self {
        MessageConfirmation {
            evidence_type,
            rejection_reason: None,
            evidence,
            transported_to_gateway: None,
            transported_to_backend: None,
        }
    }

    /// Create an evidence-type marker without payload, as sent by a backend
    /// asking the connector to generate that evidence.
    pub fn trigger(evidence_type: EvidenceType) -> Self {
        MessageConfirmation::new(evidence_type, Vec::new())
    }

    pub fn with_rejection_reason(mut self, reason: RejectionReason) -> Self {
        self.rejection_reason = Some(reason);
        self
    }

    /// True if no evidence payload is present.
    pub fn is_trigger(&self) -> bool {
        self.evidence.is_empty()
    }
}

/// Action of an AS4 message (e.g. "SubmissionAcceptanceRejection").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(pub String);

impl Action {
    pub fn new(action: impl Into<String>) -> Self {
        Action(action.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
