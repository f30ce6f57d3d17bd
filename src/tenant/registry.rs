use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::loader::build_env_rules;
use crate::config::{ConnectorConfig, TenantConfig};
use crate::domain::BusinessDomainId;
use crate::error::{ConnectorError, Result};
use crate::evidence::EvidenceActionTable;
use crate::routing::RoutingRule;

/// Everything derived from the configuration of one business domain.
#[derive(Debug)]
pub struct TenantState {
    pub id: BusinessDomainId,
    pub config: TenantConfig,
    /// Configured routing rules, in file order
    pub env_rules: Vec<RoutingRule>,
    pub evidence_actions: EvidenceActionTable,
}

impl TenantState {
    pub fn build(config: &TenantConfig) -> Result<Self> {
        let env_rules = build_env_rules(config)?;
        Ok(TenantState {
            id: config.id.clone(),
            config: config.clone(),
            env_rules,
            evidence_actions: EvidenceActionTable::from_config(&config.evidence),
        })
    }
}

/// Lazily built per-tenant state.
///
/// States are created on first access and dropped when the tenant's
/// configuration changes, so the next access sees the new configuration.
pub struct TenantRegistry {
    config: RwLock<Arc<ConnectorConfig>>,
    states: RwLock<AHashMap<BusinessDomainId, Arc<TenantState>>>,
}

impl TenantRegistry {
    pub fn new(config: Arc<ConnectorConfig>) -> Self {
        TenantRegistry {
            config: RwLock::new(config),
            states: RwLock::new(AHashMap::new()),
        }
    }

    /// Get the state of an enabled tenant, building it if needed.
    pub fn get(&self, tenant: &BusinessDomainId) -> Result<Arc<TenantState>> {
        {
            let read_guard = self.states.read();
            if let Some(state) = read_guard.get(tenant) {
                return Ok(state.clone());
            }
        }

        let mut write_guard = self.states.write();

        // Double-check after acquiring write lock
        if let Some(state) = write_guard.get(tenant) {
            return Ok(state.clone());
        }

        // Read under the states lock so a concurrent reload cannot be undone
        let config = self.config.read().clone();
        let tenant_config = config
            .tenant(tenant)
            .filter(|t| t.enabled)
            .ok_or_else(|| ConnectorError::UnknownBusinessDomain(tenant.clone()))?;

        let state = Arc::new(TenantState::build(tenant_config)?);
        debug!(tenant = %tenant, rules = state.env_rules.len(), "Built business domain state");

        write_guard.insert(tenant.clone(), state.clone());
        Ok(state)
    }

    /// Drop the cached state of one tenant.
    pub fn tenant_config_changed(&self, tenant: &BusinessDomainId) {
        if self.states.write().remove(tenant).is_some() {
            info!(tenant = %tenant, "Business domain state dropped after configuration change");
        }
    }

    /// Replace the configuration and drop all cached states.
    pub fn reload(&self, config: Arc<ConnectorConfig>) {
        let mut states = self.states.write();
        *self.config.write() = config;
        states.clear();
        info!("Business domain states dropped after configuration reload");
    }

    /// Ids of all enabled tenants.
    pub fn tenant_ids(&self) -> Vec<BusinessDomainId> {
        self.config
            .read()
            .tenants
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn config(&self) -> Arc<ConnectorConfig> {
        self.config.read().clone()
    }

    /// Number of tenants with a built state.
    pub fn active_count(&self) -> usize {
        self.states.read().len()
    }

    /// Apply every configuration published by the watcher.
    pub fn spawn_reload_listener(
        self: Arc<Self>,
        mut rx: watch::Receiver<Arc<ConnectorConfig>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let config = rx.borrow_and_update().clone();
                self.reload(config);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvidenceConfig, RoutingConfig, RoutingRuleDef};
    use crate::domain::LinkPartnerName;
    use std::time::Duration;

    fn tenant(id: &str, backend: &str) -> TenantConfig {
        TenantConfig {
            id: BusinessDomainId::new(id),
            enabled: true,
            routing: RoutingConfig {
                enabled: true,
                default_backend_name: LinkPartnerName::new(backend),
                default_gateway_name: LinkPartnerName::new("gw"),
                rules: vec![RoutingRuleDef {
                    id: "r1".to_string(),
                    link_name: LinkPartnerName::new("b2"),
                    expression: "equals(ServiceName,'EPO')".to_string(),
                    priority: 0,
                    description: None,
                }],
            },
            evidence: EvidenceConfig::default(),
        }
    }

    fn config(version: &str, tenants: Vec<TenantConfig>) -> Arc<ConnectorConfig> {
        Arc::new(ConnectorConfig {
            version: version.to_string(),
            tenants,
        })
    }

    #[test]
    fn test_lazy_state_is_shared() {
        let registry = TenantRegistry::new(config("1", vec![tenant("lane1", "a")]));
        assert_eq!(registry.active_count(), 0);

        let lane = BusinessDomainId::new("lane1");
        let s1 = registry.get(&lane).unwrap();
        let s2 = registry.get(&lane).unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(s1.env_rules.len(), 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_unknown_and_disabled_tenants() {
        let mut disabled = tenant("lane2", "b");
        disabled.enabled = false;
        let registry = TenantRegistry::new(config("1", vec![tenant("lane1", "a"), disabled]));

        assert!(matches!(
            registry.get(&BusinessDomainId::new("lane9")),
            Err(ConnectorError::UnknownBusinessDomain(_))
        ));
        assert!(registry.get(&BusinessDomainId::new("lane2")).is_err());
        assert_eq!(registry.tenant_ids(), vec![BusinessDomainId::new("lane1")]);
    }

    #[test]
    fn test_malformed_rule_surfaces_as_config_error() {
        let mut broken = tenant("lane1", "a");
        broken.routing.rules[0].expression = "equals(".to_string();
        let registry = TenantRegistry::new(config("1", vec![broken]));

        assert!(matches!(
            registry.get(&BusinessDomainId::new("lane1")),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn test_teardown_on_change() {
        let registry = TenantRegistry::new(config("1", vec![tenant("lane1", "a")]));
        let lane = BusinessDomainId::new("lane1");

        let before = registry.get(&lane).unwrap();
        registry.tenant_config_changed(&lane);
        let after = registry.get(&lane).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));

        registry.reload(config("2", vec![tenant("lane1", "z")]));
        assert_eq!(registry.active_count(), 0);
        let reloaded = registry.get(&lane).unwrap();
        assert_eq!(reloaded.config.routing.default_backend_name, LinkPartnerName::new("z"));
    }

    #[test]
    fn test_state_matches_config_after_concurrent_reloads() {
        let registry = Arc::new(TenantRegistry::new(config("0", vec![tenant("lane1", "b0")])));
        let lane = BusinessDomainId::new("lane1");

        let reloader = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 1..=200 {
                    let backend = format!("b{}", i);
                    registry.reload(config(&i.to_string(), vec![tenant("lane1", &backend)]));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let lane = lane.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        registry.get(&lane).unwrap();
                    }
                })
            })
            .collect();

        reloader.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        let state = registry.get(&lane).unwrap();
        assert_eq!(registry.config().version, "200");
        assert_eq!(state.config.routing.default_backend_name, LinkPartnerName::new("b200"));
    }

    #[tokio::test]
    async fn test_reload_listener() {
        let registry = Arc::new(TenantRegistry::new(config("1", vec![tenant("lane1", "a")])));
        let (tx, rx) = watch::channel(registry.config());
        let handle = registry.clone().spawn_reload_listener(rx);

        registry.get(&BusinessDomainId::new("lane1")).unwrap();
        tx.send(config("2", vec![tenant("lane1", "a"), tenant("lane2", "b")]))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.tenant_ids().len() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.config().version, "2");

        handle.abort();
    }
}
