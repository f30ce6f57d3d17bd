use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{BusinessDomainId, LinkPartnerName, Message};
use crate::error::Result;
use crate::storage::Storage;
use crate::tenant::TenantRegistry;

use super::rule::{RoutingRule, RuleSource};

/// In-memory rules of one tenant.
#[derive(Debug, Default)]
struct TenantRules {
    /// Most recently added first
    dynamic: Vec<RoutingRule>,
}

/// Resolves the backend link of a message from the tenant's routing rules.
///
/// Three rule sources are merged on every call: configured rules (ENV),
/// in-memory rules (DYNAMIC) and persisted rules (DURABLE). A rule
/// replaces rules of earlier sources with the same id. Rules are then
/// consulted by priority, highest first, and within equal priority
/// DURABLE before DYNAMIC before ENV.
///
/// Persisted rules and the stored default backend are read from storage
/// on every call, so writes of other connector nodes apply at once.
pub struct RoutingRuleRegistry {
    tenants: Arc<TenantRegistry>,
    storage: Arc<dyn Storage>,
    rules: RwLock<AHashMap<BusinessDomainId, Arc<Mutex<TenantRules>>>>,
}

impl RoutingRuleRegistry {
    pub fn new(tenants: Arc<TenantRegistry>, storage: Arc<dyn Storage>) -> Self {
        RoutingRuleRegistry {
            tenants,
            storage,
            rules: RwLock::new(AHashMap::new()),
        }
    }

    /// Backend link partner for `message`.
    ///
    /// First matching rule wins; without a match the tenant's default
    /// backend is returned. With rule routing disabled for the tenant the
    /// default is returned without looking at any rule.
    pub async fn resolve_destination(
        &self,
        tenant: &BusinessDomainId,
        message: &Message,
    ) -> Result<LinkPartnerName> {
        let state = self.tenants.get(tenant)?;

        if state.config.routing.enabled {
            let rules = self.list_rules(tenant).await?;
            if let Some(rule) = rules.iter().find(|r| r.match_expression.evaluate(message)) {
                debug!(
                    tenant = %tenant,
                    connector_message_id = %message.connector_message_id,
                    rule_id = %rule.id,
                    link = %rule.link_partner_name,
                    "Routing rule matched"
                );
                return Ok(rule.link_partner_name.clone());
            }
        }

        self.default_destination(tenant).await
    }

    /// Backend name of `message` following the lookup order of the
    /// connector: an already set backend name, the backend of a stored
    /// message of the same conversation, then the routing rules.
    pub async fn lookup_backend_name(
        &self,
        tenant: &BusinessDomainId,
        message: &Message,
    ) -> Result<LinkPartnerName> {
        if let Some(name) = message
            .details
            .backend_name
            .as_ref()
            .filter(|n| !n.as_str().is_empty())
        {
            return Ok(name.clone());
        }

        if let Some(conversation_id) = message
            .details
            .conversation_id
            .as_deref()
            .filter(|c| !c.is_empty())
        {
            let related = self
                .storage
                .find_messages_by_conversation_id(tenant, conversation_id)
                .await?;
            if let Some(name) = related
                .into_iter()
                .filter(|m| m.connector_message_id != message.connector_message_id)
                .find_map(|m| m.details.backend_name)
            {
                debug!(
                    tenant = %tenant,
                    conversation_id = conversation_id,
                    link = %name,
                    "Backend name taken from conversation"
                );
                return Ok(name);
            }
        }

        self.resolve_destination(tenant, message).await
    }

    /// Merged rule set in evaluation order.
    pub async fn list_rules(&self, tenant: &BusinessDomainId) -> Result<Vec<RoutingRule>> {
        let state = self.tenants.get(tenant)?;
        let durable = self.storage.list_routing_rules(tenant).await?;
        let dynamic = self.slot(tenant).lock().dynamic.clone();

        Ok(merge_rules(&state.env_rules, &dynamic, &durable))
    }

    /// Add an in-memory rule, replacing a dynamic rule with the same id.
    pub fn add_rule(&self, tenant: &BusinessDomainId, mut rule: RoutingRule) {
        rule.source = RuleSource::Dynamic;
        info!(tenant = %tenant, rule_id = %rule.id, link = %rule.link_partner_name, "Adding dynamic routing rule");

        let slot = self.slot(tenant);
        let mut rules = slot.lock();
        rules.dynamic.retain(|r| r.id != rule.id);
        rules.dynamic.insert(0, rule);
    }

    /// Remove an in-memory rule. Returns false if there was none.
    pub fn delete_rule(&self, tenant: &BusinessDomainId, rule_id: &str) -> bool {
        let slot = self.slot(tenant);
        let mut rules = slot.lock();
        let before = rules.dynamic.len();
        rules.dynamic.retain(|r| r.id != rule_id);
        let removed = rules.dynamic.len() != before;
        if removed {
            info!(tenant = %tenant, rule_id = rule_id, "Deleted dynamic routing rule");
        }
        removed
    }

    /// Persist a rule. It applies from the next call on.
    pub async fn add_rule_persisted(&self, tenant: &BusinessDomainId, mut rule: RoutingRule) -> Result<()> {
        rule.source = RuleSource::Durable;
        self.storage.save_routing_rule(tenant, &rule).await?;
        info!(tenant = %tenant, rule_id = %rule.id, link = %rule.link_partner_name, "Stored durable routing rule");
        Ok(())
    }

    /// Delete a persisted rule. Returns false if there was none.
    pub async fn delete_rule_persisted(&self, tenant: &BusinessDomainId, rule_id: &str) -> Result<bool> {
        let removed = self.storage.delete_routing_rule(tenant, rule_id).await?;
        if removed {
            info!(tenant = %tenant, rule_id = rule_id, "Deleted durable routing rule");
        }
        Ok(removed)
    }

    /// Persist a default backend that takes precedence over the configured one.
    pub async fn set_default_destination(
        &self,
        tenant: &BusinessDomainId,
        link: LinkPartnerName,
    ) -> Result<()> {
        self.tenants.get(tenant)?;
        self.storage.set_default_destination(tenant, &link).await?;
        info!(tenant = %tenant, link = %link, "Default backend changed");
        Ok(())
    }

    /// The default backend: a stored override, else the configured name.
    pub async fn default_destination(&self, tenant: &BusinessDomainId) -> Result<LinkPartnerName> {
        let state = self.tenants.get(tenant)?;
        let stored = self.storage.get_default_destination(tenant).await?;
        Ok(stored.unwrap_or_else(|| state.config.routing.default_backend_name.clone()))
    }

    fn slot(&self, tenant: &BusinessDomainId) -> Arc<Mutex<TenantRules>> {
        {
            let read_guard = self.rules.read();
            if let Some(slot) = read_guard.get(tenant) {
                return slot.clone();
            }
        }

        let mut write_guard = self.rules.write();
        write_guard
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TenantRules::default())))
            .clone()
    }
}

/// Merge the three sources into evaluation order.
fn merge_rules(
    env: &[RoutingRule],
    dynamic: &[RoutingRule],
    durable: &[RoutingRule],
) -> Vec<RoutingRule> {
    // (rule, position within its source)
    let mut merged: Vec<(RoutingRule, usize)> = Vec::with_capacity(env.len() + dynamic.len() + durable.len());

    for source in [env, dynamic, durable] {
        for (position, rule) in source.iter().enumerate() {
            merged.retain(|(r, _)| r.id != rule.id);
            merged.push((rule.clone(), position));
        }
    }

    merged.sort_by(|(a, pa), (b, pb)| {
        b.priority
            .cmp(&a.priority)
            .then(b.source.rank().cmp(&a.source.rank()))
            .then(pa.cmp(pb))
    });

    merged.into_iter().map(|(rule, _)| rule).collect()
}
