use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{BusinessDomainId, EvidenceType, LinkPartnerName};

/// Connector configuration file: one entry per business domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Changing the version makes running connectors reload the file
    pub version: String,

    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl ConnectorConfig {
    /// Configuration with no tenants, used when loading fails at startup.
    pub fn empty() -> Self {
        ConnectorConfig {
            version: "none".to_string(),
            tenants: Vec::new(),
        }
    }

    /// One enabled tenant with default evidence settings and no rules.
    pub fn single_tenant(
        id: BusinessDomainId,
        default_backend_name: LinkPartnerName,
        default_gateway_name: LinkPartnerName,
    ) -> Self {
        ConnectorConfig {
            version: "1".to_string(),
            tenants: vec![TenantConfig {
                id,
                enabled: true,
                routing: RoutingConfig {
                    enabled: true,
                    default_backend_name,
                    default_gateway_name,
                    rules: Vec::new(),
                },
                evidence: EvidenceConfig::default(),
            }],
        }
    }

    pub fn tenant(&self, id: &BusinessDomainId) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| &t.id == id)
    }
}

/// Settings of a single business domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: BusinessDomainId,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub routing: RoutingConfig,

    #[serde(default)]
    pub evidence: EvidenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Evaluate routing rules; when off every message goes to the default backend
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub default_backend_name: LinkPartnerName,

    pub default_gateway_name: LinkPartnerName,

    #[serde(default)]
    pub rules: Vec<RoutingRuleDef>,
}

/// A routing rule as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRuleDef {
    pub id: String,
    pub link_name: LinkPartnerName,
    pub expression: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Also send evidences generated from backend triggers back to the backend
    #[serde(default)]
    pub send_generated_evidences_to_backend: bool,

    /// Evidence type to AS4 action. When omitted the standard actions are used;
    /// when given it replaces them completely.
    #[serde(default)]
    pub actions: Option<HashMap<EvidenceType, String>>,

    /// Reject inbound evidence messages whose action does not match the
    /// action of their evidence type. When off a mismatch is only logged.
    #[serde(default)]
    pub enforce_action_names: bool,

    /// Seconds to wait for a relay evidence, 0 disables
    #[serde(default = "default_timeout_secs")]
    pub relay_timeout_secs: u64,

    #[serde(default = "default_warn_timeout_secs")]
    pub relay_warn_timeout_secs: u64,

    /// Seconds to wait for a delivery evidence, 0 disables
    #[serde(default = "default_timeout_secs")]
    pub delivery_timeout_secs: u64,

    #[serde(default = "default_warn_timeout_secs")]
    pub delivery_warn_timeout_secs: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        EvidenceConfig {
            send_generated_evidences_to_backend: false,
            actions: None,
            enforce_action_names: false,
            relay_timeout_secs: default_timeout_secs(),
            relay_warn_timeout_secs: default_warn_timeout_secs(),
            delivery_timeout_secs: default_timeout_secs(),
            delivery_warn_timeout_secs: default_warn_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_warn_timeout_secs() -> u64 {
    12 * 60 * 60
}
