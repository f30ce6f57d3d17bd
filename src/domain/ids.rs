use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of the business domain used when a message carries none.
pub const DEFAULT_BUSINESS_DOMAIN: &str = "lane1";

/// Tenant key ("message lane").
///
/// All rule sets, transport steps and per-tenant state are partitioned by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessDomainId(pub String);

impl BusinessDomainId {
    pub fn new(id: impl Into<String>) -> Self {
        BusinessDomainId(id.into())
    }

    /// The domain every connector instance has.
    pub fn default_lane() -> Self {
        BusinessDomainId(DEFAULT_BUSINESS_DOMAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BusinessDomainId {
    fn default() -> Self {
        BusinessDomainId::default_lane()
    }
}

impl fmt::Display for BusinessDomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connector-internal message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorMessageId(pub String);

impl ConnectorMessageId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectorMessageId(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        ConnectorMessageId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a backend or gateway link partner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkPartnerName(pub String);

impl LinkPartnerName {
    pub fn new(name: impl Into<String>) -> Self {
        LinkPartnerName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkPartnerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(pub String);

impl TransportId {
    pub fn new(id: impl Into<String>) -> Self {
        TransportId(id.into())
    }

    /// Derive the id of attempt `attempt` of `message_id` towards `link`.
    pub fn for_attempt(message_id: &ConnectorMessageId, link: &LinkPartnerName, attempt: u32) -> Self {
        TransportId(format!("{}_{}_{}", message_id, link, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
