use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::domain::{
    BusinessDomainId, ConnectorMessageId, EvidenceType, LinkPartnerName, Message,
    MessageConfirmation, MessageDirection, MessageTarget, TransportId, TransportStep,
};
use crate::routing::RoutingRule;

use super::traits::{MessageErrorRecord, Storage};
use super::unit_of_work::{StagedWrites, UnitOfWork};

#[derive(Debug, Default)]
struct Tables {
    messages: Mutex<HashMap<ConnectorMessageId, Message>>,
    steps: Mutex<HashMap<TransportId, TransportStep>>,
    errors: Mutex<Vec<MessageErrorRecord>>,
    /// Most recently written first
    rules: Mutex<HashMap<BusinessDomainId, Vec<RoutingRule>>>,
    default_destinations: Mutex<HashMap<BusinessDomainId, LinkPartnerName>>,
}

/// Value an entry had before a unit of work wrote it.
#[derive(Debug)]
enum Undo {
    Message(ConnectorMessageId, Option<Message>),
    Step(TransportId, Option<TransportStep>),
    Error(MessageErrorRecord),
    Rules(BusinessDomainId, Option<Vec<RoutingRule>>),
    DefaultDestination(BusinessDomainId, Option<LinkPartnerName>),
}

fn restore<K, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>)
where
    K: std::hash::Hash + Eq,
{
    match prior {
        Some(value) => map.insert(key, value),
        None => map.remove(&key),
    };
}

impl Tables {
    fn undo(&self, entry: Undo) {
        match entry {
            Undo::Message(id, prior) => restore(&mut self.messages.lock(), id, prior),
            Undo::Step(id, prior) => restore(&mut self.steps.lock(), id, prior),
            Undo::Error(record) => {
                let mut errors = self.errors.lock();
                if let Some(pos) = errors.iter().rposition(|e| e == &record) {
                    errors.remove(pos);
                }
            }
            Undo::Rules(tenant, prior) => restore(&mut self.rules.lock(), tenant, prior),
            Undo::DefaultDestination(tenant, prior) => {
                restore(&mut self.default_destinations.lock(), tenant, prior)
            }
        }
    }
}

/// Undo log of a unit of work on a [`MemoryStore`].
struct MemoryUnit {
    tables: Arc<Tables>,
    undo: Mutex<Vec<Undo>>,
}

#[async_trait]
impl StagedWrites for MemoryUnit {
    async fn commit(&self) -> anyhow::Result<()> {
        self.undo.lock().clear();
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let undo = std::mem::take(&mut *self.undo.lock());
        for entry in undo.into_iter().rev() {
            self.tables.undo(entry);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory storage for tests and single node runs.
///
/// Writes of a unit of work are visible to everyone right away and undone
/// when it rolls back.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail (for testing).
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    /// Undo [`MemoryStore::fail_on`].
    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// All stored messages (for assertions).
    pub fn messages(&self) -> Vec<Message> {
        self.tables.messages.lock().values().cloned().collect()
    }

    /// All stored transport steps (for assertions).
    pub fn transport_steps(&self) -> Vec<TransportStep> {
        self.tables.steps.lock().values().cloned().collect()
    }

    fn check(&self, operation: &'static str) -> anyhow::Result<()> {
        if self.failing.lock().contains(operation) {
            anyhow::bail!("injected failure in {}", operation);
        }
        Ok(())
    }

    /// Keep the prior value for rollback when a unit of work of this store
    /// is running.
    fn stage(&self, prior: impl FnOnce() -> Undo) {
        UnitOfWork::with_current(|unit: &MemoryUnit| {
            if Arc::ptr_eq(&unit.tables, &self.tables) {
                unit.undo.lock().push(prior());
            }
        });
    }

    fn update_message<F>(&self, id: &ConnectorMessageId, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Message),
    {
        let mut messages = self.tables.messages.lock();
        let message = messages
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no message stored with id {}", id))?;
        self.stage(|| Undo::Message(id.clone(), Some(message.clone())));
        f(message);
        Ok(())
    }

    fn find_message<F>(&self, pred: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.tables.messages.lock().values().find(|m| pred(m)).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn begin(&self) -> anyhow::Result<UnitOfWork> {
        self.check("begin")?;
        Ok(UnitOfWork::new(Arc::new(MemoryUnit {
            tables: self.tables.clone(),
            undo: Mutex::new(Vec::new()),
        })))
    }

    async fn persist_message(&self, message: &Message) -> anyhow::Result<()> {
        self.check("persist_message")?;
        let mut messages = self.tables.messages.lock();
        let prior = messages.get(&message.connector_message_id);
        let related = prior
            .map(|m| m.related_confirmations.clone())
            .unwrap_or_default();
        self.stage(|| Undo::Message(message.connector_message_id.clone(), prior.cloned()));

        let mut stored = message.clone();
        for confirmation in related {
            if !stored.has_related_confirmation(confirmation.evidence_type) {
                stored.related_confirmations.push(confirmation);
            }
        }
        messages.insert(stored.connector_message_id.clone(), stored);
        Ok(())
    }

    async fn get_message(&self, id: &ConnectorMessageId) -> anyhow::Result<Option<Message>> {
        self.check("get_message")?;
        Ok(self.tables.messages.lock().get(id).cloned())
    }

    async fn find_message_by_ebms_id(
        &self,
        tenant: &BusinessDomainId,
        ebms_id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>> {
        self.check("find_message_by_ebms_id")?;
        Ok(self.find_message(|m| {
            &m.tenant == tenant
                && m.direction() == direction
                && m.details.ebms_message_id.as_deref() == Some(ebms_id)
        }))
    }

    async fn find_message_by_backend_id(
        &self,
        tenant: &BusinessDomainId,
        backend_id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>> {
        self.check("find_message_by_backend_id")?;
        Ok(self.find_message(|m| {
            &m.tenant == tenant
                && m.direction() == direction
                && m.details.backend_message_id.as_deref() == Some(backend_id)
        }))
    }

    async fn find_messages_by_conversation_id(
        &self,
        tenant: &BusinessDomainId,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<Message>> {
        self.check("find_messages_by_conversation_id")?;
        Ok(self
            .tables
            .messages
            .lock()
            .values()
            .filter(|m| {
                &m.tenant == tenant && m.details.conversation_id.as_deref() == Some(conversation_id)
            })
            .cloned()
            .collect())
    }

    async fn set_remote_message_id(
        &self,
        id: &ConnectorMessageId,
        target: MessageTarget,
        remote_id: &str,
    ) -> anyhow::Result<()> {
        self.check("set_remote_message_id")?;
        self.update_message(id, |m| match target {
            MessageTarget::Gateway => m.details.ebms_message_id = Some(remote_id.to_string()),
            MessageTarget::Backend => m.details.backend_message_id = Some(remote_id.to_string()),
        })
    }

    async fn set_delivered(
        &self,
        id: &ConnectorMessageId,
        target: MessageTarget,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.check("set_delivered")?;
        self.update_message(id, |m| match target {
            MessageTarget::Gateway => m.details.delivered_to_gateway = Some(at),
            MessageTarget::Backend => m.details.delivered_to_backend = Some(at),
        })
    }

    async fn confirm_message(&self, id: &ConnectorMessageId, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.check("confirm_message")?;
        self.update_message(id, |m| m.details.confirmed = Some(at))
    }

    async fn reject_message(&self, id: &ConnectorMessageId, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.check("reject_message")?;
        self.update_message(id, |m| m.details.rejected = Some(at))
    }

    async fn clear_message_content(&self, id: &ConnectorMessageId) -> anyhow::Result<()> {
        self.check("clear_message_content")?;
        self.update_message(id, |m| {
            if let Some(content) = m.content.as_mut() {
                content.document.clear();
            }
        })
    }

    async fn find_messages_awaiting_evidence(
        &self,
        tenant: &BusinessDomainId,
        min_priority: u8,
    ) -> anyhow::Result<Vec<Message>> {
        self.check("find_messages_awaiting_evidence")?;
        Ok(self
            .tables
            .messages
            .lock()
            .values()
            .filter(|m| {
                &m.tenant == tenant
                    && m.is_business_message()
                    && m.direction() == MessageDirection::BackendToGateway
                    && m.details.delivered_to_gateway.is_some()
                    && !m.details.is_confirmed_or_rejected()
                    && m.highest_evidence_priority() < min_priority
            })
            .cloned()
            .collect())
    }

    async fn add_related_confirmation(
        &self,
        id: &ConnectorMessageId,
        confirmation: &MessageConfirmation,
    ) -> anyhow::Result<()> {
        self.check("add_related_confirmation")?;
        self.update_message(id, |m| {
            m.related_confirmations
                .retain(|c| c.evidence_type != confirmation.evidence_type);
            m.related_confirmations.push(confirmation.clone());
        })
    }

    async fn set_confirmation_transported(
        &self,
        id: &ConnectorMessageId,
        evidence_type: EvidenceType,
        target: MessageTarget,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.check("set_confirmation_transported")?;
        self.update_message(id, |m| {
            for c in m
                .related_confirmations
                .iter_mut()
                .filter(|c| c.evidence_type == evidence_type)
            {
                match target {
                    MessageTarget::Gateway => c.transported_to_gateway = Some(at),
                    MessageTarget::Backend => c.transported_to_backend = Some(at),
                }
            }
        })
    }

    async fn create_transport_step(&self, step: &TransportStep) -> anyhow::Result<()> {
        self.check("create_transport_step")?;
        let mut steps = self.tables.steps.lock();
        if steps.contains_key(&step.transport_id) {
            anyhow::bail!("transport step {} already exists", step.transport_id);
        }
        self.stage(|| Undo::Step(step.transport_id.clone(), None));
        steps.insert(step.transport_id.clone(), step.clone());
        Ok(())
    }

    async fn update_transport_step(&self, step: &TransportStep) -> anyhow::Result<()> {
        self.check("update_transport_step")?;
        let mut steps = self.tables.steps.lock();
        match steps.get_mut(&step.transport_id) {
            Some(stored) => {
                self.stage(|| Undo::Step(step.transport_id.clone(), Some(stored.clone())));
                *stored = step.clone();
                Ok(())
            }
            None => anyhow::bail!("no transport step {}", step.transport_id),
        }
    }

    async fn get_transport_step(&self, id: &TransportId) -> anyhow::Result<Option<TransportStep>> {
        self.check("get_transport_step")?;
        Ok(self.tables.steps.lock().get(id).cloned())
    }

    async fn highest_attempt(
        &self,
        id: &ConnectorMessageId,
        link: &LinkPartnerName,
    ) -> anyhow::Result<u32> {
        self.check("highest_attempt")?;
        Ok(self
            .tables
            .steps
            .lock()
            .values()
            .filter(|s| &s.connector_message_id == id && &s.link_partner_name == link)
            .map(|s| s.attempt)
            .max()
            .unwrap_or(0))
    }

    async fn open_transport_steps(&self, link: &LinkPartnerName) -> anyhow::Result<Vec<TransportStep>> {
        self.check("open_transport_steps")?;
        let mut steps: Vec<TransportStep> = self
            .tables
            .steps
            .lock()
            .values()
            .filter(|s| &s.link_partner_name == link && s.final_state_reached.is_none())
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created);
        Ok(steps)
    }

    async fn persist_message_error(&self, record: &MessageErrorRecord) -> anyhow::Result<()> {
        self.check("persist_message_error")?;
        self.stage(|| Undo::Error(record.clone()));
        self.tables.errors.lock().push(record.clone());
        Ok(())
    }

    async fn message_errors(&self, id: &ConnectorMessageId) -> anyhow::Result<Vec<MessageErrorRecord>> {
        self.check("message_errors")?;
        Ok(self
            .tables
            .errors
            .lock()
            .iter()
            .filter(|e| &e.connector_message_id == id)
            .cloned()
            .collect())
    }

    async fn list_routing_rules(&self, tenant: &BusinessDomainId) -> anyhow::Result<Vec<RoutingRule>> {
        self.check("list_routing_rules")?;
        Ok(self.tables.rules.lock().get(tenant).cloned().unwrap_or_default())
    }

    async fn save_routing_rule(&self, tenant: &BusinessDomainId, rule: &RoutingRule) -> anyhow::Result<()> {
        self.check("save_routing_rule")?;
        let mut rules = self.tables.rules.lock();
        self.stage(|| Undo::Rules(tenant.clone(), rules.get(tenant).cloned()));
        let tenant_rules = rules.entry(tenant.clone()).or_default();
        tenant_rules.retain(|r| r.id != rule.id);
        tenant_rules.insert(0, rule.clone());
        Ok(())
    }

    async fn delete_routing_rule(&self, tenant: &BusinessDomainId, rule_id: &str) -> anyhow::Result<bool> {
        self.check("delete_routing_rule")?;
        let mut rules = self.tables.rules.lock();
        let Some(tenant_rules) = rules.get_mut(tenant) else {
            return Ok(false);
        };
        self.stage(|| Undo::Rules(tenant.clone(), Some(tenant_rules.clone())));
        let before = tenant_rules.len();
        tenant_rules.retain(|r| r.id != rule_id);
        Ok(tenant_rules.len() != before)
    }

    async fn get_default_destination(
        &self,
        tenant: &BusinessDomainId,
    ) -> anyhow::Result<Option<LinkPartnerName>> {
        self.check("get_default_destination")?;
        Ok(self.tables.default_destinations.lock().get(tenant).cloned())
    }

    async fn set_default_destination(
        &self,
        tenant: &BusinessDomainId,
        link: &LinkPartnerName,
    ) -> anyhow::Result<()> {
        self.check("set_default_destination")?;
        let mut destinations = self.tables.default_destinations.lock();
        self.stage(|| Undo::DefaultDestination(tenant.clone(), destinations.get(tenant).cloned()));
        destinations.insert(tenant.clone(), link.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageContent, MessageDetails};
    use crate::routing::RuleSource;

    fn business(ebms: &str) -> Message {
        let mut details = MessageDetails::new(MessageDirection::GatewayToBackend);
        details.ebms_message_id = Some(ebms.to_string());
        details.conversation_id = Some("conv-1".to_string());
        Message::business(
            BusinessDomainId::default_lane(),
            details,
            MessageContent::new("doc.xml", Vec::new()),
        )
    }

    #[tokio::test]
    async fn test_find_by_ebms_id_respects_direction_and_tenant() {
        let store = MemoryStore::new();
        let msg = business("E1");
        store.persist_message(&msg).await.unwrap();

        let lane = BusinessDomainId::default_lane();
        let found = store
            .find_message_by_ebms_id(&lane, "E1", MessageDirection::GatewayToBackend)
            .await
            .unwrap();
        assert_eq!(found.unwrap().connector_message_id, msg.connector_message_id);

        assert!(store
            .find_message_by_ebms_id(&lane, "E1", MessageDirection::BackendToGateway)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_message_by_ebms_id(&BusinessDomainId::new("lane2"), "E1", MessageDirection::GatewayToBackend)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_persist_keeps_related_confirmations() {
        let store = MemoryStore::new();
        let mut msg = business("E1");
        store.persist_message(&msg).await.unwrap();
        store
            .add_related_confirmation(
                &msg.connector_message_id,
                &MessageConfirmation::new(EvidenceType::Delivery, vec![1]),
            )
            .await
            .unwrap();

        msg.details.backend_name = Some(LinkPartnerName::new("b1"));
        store.persist_message(&msg).await.unwrap();

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        assert!(stored.has_related_confirmation(EvidenceType::Delivery));
        assert_eq!(stored.details.backend_name, Some(LinkPartnerName::new("b1")));
    }

    #[tokio::test]
    async fn test_rules_most_recent_first() {
        let store = MemoryStore::new();
        let lane = BusinessDomainId::default_lane();
        for id in ["a", "b", "a"] {
            let rule = RoutingRule::parse(
                id,
                LinkPartnerName::new("b1"),
                "equals(ServiceName,'x')",
                RuleSource::Durable,
            )
            .unwrap();
            store.save_routing_rule(&lane, &rule).await.unwrap();
        }

        let ids: Vec<String> = store
            .list_routing_rules(&lane)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.delete_routing_rule(&lane, "a").await.unwrap());
        assert!(!store.delete_routing_rule(&lane, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_awaiting_evidence() {
        let store = MemoryStore::new();
        let lane = BusinessDomainId::default_lane();

        let mut outgoing = business("E1");
        outgoing.details.direction = MessageDirection::BackendToGateway;
        outgoing.details.delivered_to_gateway = Some(Utc::now());
        store.persist_message(&outgoing).await.unwrap();

        let relay = EvidenceType::RelayRemmdAcceptance.priority();
        let delivery = EvidenceType::Delivery.priority();
        assert_eq!(store.find_messages_awaiting_evidence(&lane, relay).await.unwrap().len(), 1);

        store
            .add_related_confirmation(
                &outgoing.connector_message_id,
                &MessageConfirmation::new(EvidenceType::RelayRemmdAcceptance, vec![1]),
            )
            .await
            .unwrap();
        assert!(store.find_messages_awaiting_evidence(&lane, relay).await.unwrap().is_empty());
        assert_eq!(store.find_messages_awaiting_evidence(&lane, delivery).await.unwrap().len(), 1);

        store.reject_message(&outgoing.connector_message_id, Utc::now()).await.unwrap();
        assert!(store.find_messages_awaiting_evidence(&lane, delivery).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_unit_of_work_is_rolled_back() {
        let store = MemoryStore::new();
        let msg = business("E1");
        store.persist_message(&msg).await.unwrap();
        let id = msg.connector_message_id.clone();

        let unit = store.begin().await.unwrap();
        let result: anyhow::Result<()> = unit
            .run(async {
                store
                    .add_related_confirmation(&id, &MessageConfirmation::new(EvidenceType::Delivery, vec![1]))
                    .await?;
                store.confirm_message(&id, Utc::now()).await?;
                store.persist_message(&business("E2")).await?;
                let step = TransportStep::new(&msg, LinkPartnerName::new("gw"), 1);
                store.create_transport_step(&step).await?;
                anyhow::bail!("submission failed")
            })
            .await;
        assert!(result.is_err());

        let stored = store.get_message(&id).await.unwrap().unwrap();
        assert!(!stored.has_related_confirmation(EvidenceType::Delivery));
        assert!(stored.details.confirmed.is_none());
        assert_eq!(store.messages().len(), 1);
        assert!(store.transport_steps().is_empty());
    }

    #[tokio::test]
    async fn test_committed_unit_of_work_keeps_writes() {
        let store = MemoryStore::new();
        let msg = business("E1");

        let unit = store.begin().await.unwrap();
        let result: anyhow::Result<()> = unit.run(store.persist_message(&msg)).await;
        result.unwrap();

        // a later failing unit does not touch committed writes
        let unit = store.begin().await.unwrap();
        let result: anyhow::Result<()> = unit
            .run(async {
                store.reject_message(&msg.connector_message_id, Utc::now()).await?;
                anyhow::bail!("boom")
            })
            .await;
        assert!(result.is_err());

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        assert!(stored.details.rejected.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_on("get_message");
        assert!(store.get_message(&ConnectorMessageId::new("x")).await.is_err());
        store.clear_failures();
        assert!(store.get_message(&ConnectorMessageId::new("x")).await.unwrap().is_none());
    }
}
