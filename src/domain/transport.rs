use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use super::ids::{ConnectorMessageId, LinkPartnerName, TransportId};
use super::message::Message;

/// State of a transport attempt, ordered by priority.
///
/// `Accepted` and `Failed` are terminal: the first of them reached by a
/// step fixes its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TransportState {
    /// Handed to the link, no answer yet
    Pending = 1,
    /// Fetched by a pull-style link partner, not yet acknowledged
    PendingDownloaded = 2,
    /// Link partner confirmed receipt
    Accepted = 10,
    /// Link partner reported an error
    Failed = 11,
}

impl TransportState {
    #[inline]
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// Returns true for `Accepted` and `Failed`.
    #[inline]
    pub fn is_final(&self) -> bool {
        self.priority() >= 10
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Pending => "PENDING",
            TransportState::PendingDownloaded => "PENDING_DOWNLOADED",
            TransportState::Accepted => "ACCEPTED",
            TransportState::Failed => "FAILED",
        }
    }

    /// Parse from string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(TransportState::Pending),
            "PENDING_DOWNLOADED" => Some(TransportState::PendingDownloaded),
            "ACCEPTED" => Some(TransportState::Accepted),
            "FAILED" => Some(TransportState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a step's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub created: DateTime<Utc>,
    pub state: TransportState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl StatusUpdate {
    pub fn new(state: TransportState) -> Self {
        StatusUpdate {
            created: Utc::now(),
            state,
            text: None,
        }
    }
}

/// Error reported by a link partner for a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    pub source: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl MessageError {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        MessageError {
            source: source.into(),
            text: text.into(),
            details: None,
        }
    }
}

/// Status report coming back from the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportStatusUpdate {
    pub state: TransportState,
    /// ebms id (gateway) or backend id (backend) assigned by the partner
    #[serde(default)]
    pub remote_message_id: Option<String>,
    /// Id of the transport itself, e.g. a JMS id
    #[serde(default)]
    pub transport_impl_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<MessageError>,
    #[serde(default)]
    pub text: Option<String>,
}

impl TransportStatusUpdate {
    pub fn new(state: TransportState) -> Self {
        TransportStatusUpdate {
            state,
            remote_message_id: None,
            transport_impl_id: None,
            errors: Vec::new(),
            text: None,
        }
    }

    pub fn accepted(remote_message_id: impl Into<String>) -> Self {
        let mut update = TransportStatusUpdate::new(TransportState::Accepted);
        update.remote_message_id = Some(remote_message_id.into());
        update
    }

    pub fn failed(errors: Vec<MessageError>) -> Self {
        let mut update = TransportStatusUpdate::new(TransportState::Failed);
        update.errors = errors;
        update
    }
}

/// One attempt to hand a message to a link partner.
///
/// Steps are never deleted; the status history is the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportStep {
    pub transport_id: TransportId,
    pub connector_message_id: ConnectorMessageId,
    pub link_partner_name: LinkPartnerName,
    pub attempt: u32,
    pub created: DateTime<Utc>,

    /// Snapshot of the message as it was handed over. `None` when the
    /// stored snapshot could not be read back.
    #[serde(default)]
    pub transported_message: Option<Message>,

    #[serde(default)]
    pub remote_message_id: Option<String>,
    #[serde(default)]
    pub transport_system_message_id: Option<String>,

    #[serde(default)]
    pub status_history: SmallVec<[StatusUpdate; 4]>,

    #[serde(default)]
    pub final_state_reached: Option<DateTime<Utc>>,
}

impl TransportStep {
    /// Create a step for `message` without any status yet.
    pub fn new(message: &Message, link_partner_name: LinkPartnerName, attempt: u32) -> Self {
        TransportStep {
            transport_id: TransportId::for_attempt(
                &message.connector_message_id,
                &link_partner_name,
                attempt,
            ),
            connector_message_id: message.connector_message_id.clone(),
            link_partner_name,
            attempt,
            created: Utc::now(),
            transported_message: Some(message.clone()),
            remote_message_id: None,
            transport_system_message_id: None,
            status_history: SmallVec::new(),
            final_state_reached: None,
        }
    }

    /// Append a status entry.
    ///
    /// Returns true if this entry is the first terminal state of the step.
    pub fn add_status(&mut self, update: StatusUpdate) -> bool {
        let first_final = update.state.is_final() && self.final_state_reached.is_none();
        if first_final {
            self.final_state_reached = Some(update.created);
        }
        self.status_history.push(update);
        first_final
    }

    /// Effective state: the first terminal state if one was reached,
    /// otherwise the latest entry.
    pub fn state(&self) -> Option<TransportState> {
        if self.final_state_reached.is_some() {
            return self
                .status_history
                .iter()
                .find(|u| u.state.is_final())
                .map(|u| u.state);
        }
        self.status_history.last().map(|u| u.state)
    }

    pub fn is_in_state(&self, state: TransportState) -> bool {
        self.state() == Some(state)
    }

    pub fn is_pending(&self) -> bool {
        self.is_in_state(TransportState::Pending)
    }

    /// Set the remote id unless one is already present.
    pub fn fix_remote_message_id(&mut self, id: Option<&str>) {
        if is_blank(self.remote_message_id.as_deref()) {
            if let Some(id) = id.filter(|s| !s.is_empty()) {
                self.remote_message_id = Some(id.to_string());
            }
        }
    }

    /// Set the transport implementation id unless one is already present.
    pub fn fix_transport_system_message_id(&mut self, id: Option<&str>) {
        if is_blank(self.transport_system_message_id.as_deref()) {
            if let Some(id) = id.filter(|s| !s.is_empty()) {
                self.transport_system_message_id = Some(id.to_string());
            }
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(str::is_empty).unwrap_or(true)
}
