use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::evidence::{Action, EvidenceType, MessageConfirmation};
use super::ids::{BusinessDomainId, ConnectorMessageId, LinkPartnerName};

/// Which side of the connector a message comes from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageTarget {
    Backend,
    Gateway,
}

/// Direction of a message through the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDirection {
    BackendToGateway,
    GatewayToBackend,
}

impl MessageDirection {
    /// The opposite direction.
    pub fn revert(self) -> Self {
        match self {
            MessageDirection::BackendToGateway => MessageDirection::GatewayToBackend,
            MessageDirection::GatewayToBackend => MessageDirection::BackendToGateway,
        }
    }

    pub fn source(self) -> MessageTarget {
        match self {
            MessageDirection::BackendToGateway => MessageTarget::Backend,
            MessageDirection::GatewayToBackend => MessageTarget::Gateway,
        }
    }

    pub fn target(self) -> MessageTarget {
        match self {
            MessageDirection::BackendToGateway => MessageTarget::Gateway,
            MessageDirection::GatewayToBackend => MessageTarget::Backend,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::BackendToGateway => "BACKEND_TO_GATEWAY",
            MessageDirection::GatewayToBackend => "GATEWAY_TO_BACKEND",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BACKEND_TO_GATEWAY" => Some(MessageDirection::BackendToGateway),
            "GATEWAY_TO_BACKEND" => Some(MessageDirection::GatewayToBackend),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An AS4 party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub party_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Party {
    pub fn new(party_id: impl Into<String>) -> Self {
        Party {
            party_id: party_id.into(),
            party_id_type: None,
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// An AS4 service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            service_type: None,
        }
    }
}

/// Routing and bookkeeping attributes of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDetails {
    pub direction: MessageDirection,

    #[serde(default)]
    pub ebms_message_id: Option<String>,
    #[serde(default)]
    pub backend_message_id: Option<String>,
    #[serde(default)]
    pub ref_to_message_id: Option<String>,
    #[serde(default)]
    pub ref_to_backend_message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub service: Service,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub from_party: Option<Party>,
    #[serde(default)]
    pub to_party: Option<Party>,
    #[serde(default)]
    pub original_sender: Option<String>,
    #[serde(default)]
    pub final_recipient: Option<String>,

    /// Backend link the message belongs to
    #[serde(default)]
    pub backend_name: Option<LinkPartnerName>,
    /// Gateway link the message is sent over
    #[serde(default)]
    pub gateway_name: Option<LinkPartnerName>,
    /// Business message an evidence message was generated for
    #[serde(default)]
    pub caused_by: Option<ConnectorMessageId>,

    #[serde(default)]
    pub delivered_to_gateway: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_to_backend: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected: Option<DateTime<Utc>>,
}

impl MessageDetails {
    pub fn new(direction: MessageDirection) -> Self {
        MessageDetails {
            direction,
            ebms_message_id: None,
            backend_message_id: None,
            ref_to_message_id: None,
            ref_to_backend_message_id: None,
            conversation_id: None,
            service: Service::default(),
            action: None,
            from_party: None,
            to_party: None,
            original_sender: None,
            final_recipient: None,
            backend_name: None,
            gateway_name: None,
            caused_by: None,
            delivered_to_gateway: None,
            delivered_to_backend: None,
            confirmed: None,
            rejected: None,
        }
    }

    /// True once the message reached a confirmed or rejected outcome.
    pub fn is_confirmed_or_rejected(&self) -> bool {
        self.confirmed.is_some() || self.rejected.is_some()
    }

    /// Time the message was handed to its target link, by direction.
    pub fn delivery_time(&self) -> Option<DateTime<Utc>> {
        match self.direction {
            MessageDirection::BackendToGateway => self.delivered_to_gateway,
            MessageDirection::GatewayToBackend => self.delivered_to_backend,
        }
    }
}

/// Business document of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub document_name: String,
    #[serde(default)]
    pub document: Vec<u8>,
}

impl MessageContent {
    pub fn new(document_name: impl Into<String>, document: Vec<u8>) -> Self {
        MessageContent {
            document_name: document_name.into(),
            document,
        }
    }
}

/// A message handled by the connector: business, evidence or evidence trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub connector_message_id: ConnectorMessageId,

    #[serde(default)]
    pub tenant: BusinessDomainId,

    pub details: MessageDetails,

    #[serde(default)]
    pub content: Option<MessageContent>,

    /// Confirmations travelling with this message
    #[serde(default)]
    pub transported_confirmations: Vec<MessageConfirmation>,

    /// Confirmations stored for this (business) message
    #[serde(default)]
    pub related_confirmations: Vec<MessageConfirmation>,
}

impl Message {
    /// Create a business message with a fresh connector id.
    pub fn business(tenant: BusinessDomainId, details: MessageDetails, content: MessageContent) -> Self {
        Message {
            connector_message_id: ConnectorMessageId::generate(),
            tenant,
            details,
            content: Some(content),
            transported_confirmations: Vec::new(),
            related_confirmations: Vec::new(),
        }
    }

    /// Create an evidence message transporting exactly one confirmation.
    pub fn evidence(tenant: BusinessDomainId, details: MessageDetails, confirmation: MessageConfirmation) -> Self {
        Message {
            connector_message_id: ConnectorMessageId::generate(),
            tenant,
            details,
            content: None,
            transported_confirmations: vec![confirmation],
            related_confirmations: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: ConnectorMessageId) -> Self {
        self.connector_message_id = id;
        self
    }

    pub fn direction(&self) -> MessageDirection {
        self.details.direction
    }

    pub fn is_business_message(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_evidence_message(&self) -> bool {
        self.content.is_none() && self.transported_confirmations.len() == 1
    }

    /// An evidence message whose confirmation has no payload yet.
    pub fn is_evidence_trigger(&self) -> bool {
        self.is_evidence_message() && self.transported_confirmations[0].is_trigger()
    }

    /// Evidence type of an evidence message.
    pub fn evidence_type(&self) -> Option<EvidenceType> {
        if self.is_evidence_message() {
            Some(self.transported_confirmations[0].evidence_type)
        } else {
            None
        }
    }

    /// True if a confirmation of `evidence_type` is already related to this message.
    pub fn has_related_confirmation(&self, evidence_type: EvidenceType) -> bool {
        self.related_confirmations
            .iter()
            .any(|c| c.evidence_type == evidence_type)
    }

    /// Highest priority of the related confirmations, 0 if none.
    pub fn highest_evidence_priority(&self) -> u8 {
        self.related_confirmations
            .iter()
            .map(|c| c.evidence_type.priority())
            .max()
            .unwrap_or(0)
    }
}
