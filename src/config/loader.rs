use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::routing::{MalformedExpression, RoutingRule, RuleSource};

use super::tenant::{ConnectorConfig, TenantConfig};

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Routing rule [{rule_id}] of business domain [{tenant}]: {source}")]
    Expression {
        tenant: String,
        rule_id: String,
        #[source]
        source: MalformedExpression,
    },
}

/// Load and validate a connector configuration file.
pub fn load_connector_config(path: impl AsRef<Path>) -> Result<ConnectorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ConnectorConfig = serde_yaml::from_str(&content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Parse the configured routing rules of a tenant, in file order.
pub fn build_env_rules(tenant: &TenantConfig) -> Result<Vec<RoutingRule>, ConfigError> {
    tenant
        .routing
        .rules
        .iter()
        .map(|def| {
            let rule = RoutingRule::parse(
                def.id.clone(),
                def.link_name.clone(),
                &def.expression,
                RuleSource::Env,
            )
            .map_err(|source| ConfigError::Expression {
                tenant: tenant.id.to_string(),
                rule_id: def.id.clone(),
                source,
            })?
            .with_priority(def.priority);

            Ok(match &def.description {
                Some(description) => rule.with_description(description.clone()),
                None => rule,
            })
        })
        .collect()
}

fn validate_config(config: &ConnectorConfig) -> Result<(), ConfigError> {
    if config.version.is_empty() {
        return Err(ConfigError::Validation(
            "Configuration version cannot be empty".to_string(),
        ));
    }

    let mut seen_tenants = HashSet::new();
    for tenant in &config.tenants {
        if tenant.id.as_str().is_empty() {
            return Err(ConfigError::Validation(
                "Business domain id cannot be empty".to_string(),
            ));
        }
        if !seen_tenants.insert(&tenant.id) {
            return Err(ConfigError::Validation(format!(
                "Duplicate business domain: {}",
                tenant.id
            )));
        }
        validate_tenant(tenant)?;
    }

    Ok(())
}

fn validate_tenant(tenant: &TenantConfig) -> Result<(), ConfigError> {
    if tenant.routing.default_backend_name.as_str().is_empty() {
        return Err(ConfigError::Validation(format!(
            "Business domain {} has no default backend name",
            tenant.id
        )));
    }
    if tenant.routing.default_gateway_name.as_str().is_empty() {
        return Err(ConfigError::Validation(format!(
            "Business domain {} has no default gateway name",
            tenant.id
        )));
    }

    let mut seen_ids = HashSet::new();
    for rule in &tenant.routing.rules {
        if !seen_ids.insert(&rule.id) {
            return Err(ConfigError::Validation(format!(
                "Duplicate routing rule ID {} in business domain {}",
                rule.id, tenant.id
            )));
        }
        if rule.link_name.as_str().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Routing rule {} in business domain {} has no link name",
                rule.id, tenant.id
            )));
        }
    }
    build_env_rules(tenant)?;

    if let Some(actions) = &tenant.evidence.actions {
        if let Some((evidence_type, _)) = actions.iter().find(|(_, a)| a.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Empty action for evidence type {} in business domain {}",
                evidence_type, tenant.id
            )));
        }
    }

    Ok(())
}

/// Loads the connector configuration from a fixed path.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigLoader { path: path.into() }
    }

    pub fn load(&self) -> Result<ConnectorConfig, ConfigError> {
        load_connector_config(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
