use std::sync::Arc;
use tracing::info;

use crate::domain::{
    Action, BusinessDomainId, ConnectorMessageId, LinkPartnerName, Message, MessageConfirmation,
    MessageTarget, TransportId,
};
use crate::error::Result;
use crate::evidence::ConfirmationCreator;
use crate::routing::RoutingRuleRegistry;
use crate::tenant::TenantRegistry;
use crate::transport::TransportStateService;

use super::outbox::{OutboundMessage, Outbox};

/// Where an evidence message travels, relative to its business message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceRoute {
    /// Back towards the sender of the business message
    Opposite,
    /// Along with the business message, towards its recipient side
    Same,
}

/// Hands messages to their link partner: resolves the link, opens a
/// transport step and puts the message into the outbox.
pub struct LinkSubmitter {
    tenants: Arc<TenantRegistry>,
    routing: Arc<RoutingRuleRegistry>,
    transports: Arc<TransportStateService>,
    confirmations: Arc<ConfirmationCreator>,
}

impl LinkSubmitter {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        routing: Arc<RoutingRuleRegistry>,
        transports: Arc<TransportStateService>,
        confirmations: Arc<ConfirmationCreator>,
    ) -> Self {
        LinkSubmitter {
            tenants,
            routing,
            transports,
            confirmations,
        }
    }

    /// Gateway link of a message: the one it names, else the tenant default.
    pub fn gateway_name(&self, tenant: &BusinessDomainId, message: &Message) -> Result<LinkPartnerName> {
        if let Some(name) = message
            .details
            .gateway_name
            .as_ref()
            .filter(|n| !n.as_str().is_empty())
        {
            return Ok(name.clone());
        }
        Ok(self.tenants.get(tenant)?.config.routing.default_gateway_name.clone())
    }

    /// Submit `message` to the link partner of its direction's target.
    pub async fn submit(
        &self,
        tenant: &BusinessDomainId,
        mut message: Message,
        outbox: &mut Outbox,
    ) -> Result<TransportId> {
        let target = message.direction().target();
        let link = match target {
            MessageTarget::Gateway => {
                let link = self.gateway_name(tenant, &message)?;
                message.details.gateway_name = Some(link.clone());
                link
            }
            MessageTarget::Backend => {
                let link = self.routing.lookup_backend_name(tenant, &message).await?;
                message.details.backend_name = Some(link.clone());
                link
            }
        };

        let transport_id = self.transports.create_transport_for(&message, &link).await?;
        info!(
            tenant = %tenant,
            connector_message_id = %message.connector_message_id,
            transport_id = %transport_id,
            link = %link,
            "Submitting message to link partner"
        );

        outbox.push(OutboundMessage {
            transport_id: transport_id.clone(),
            link_partner_name: link,
            target,
            message,
        });
        Ok(transport_id)
    }

    /// Wrap `confirmation` into an evidence message for `business` and
    /// submit it along `route`.
    ///
    /// `id` is reused as connector id of the evidence message when given.
    pub async fn submit_confirmation(
        &self,
        tenant: &BusinessDomainId,
        id: Option<ConnectorMessageId>,
        business: &Message,
        confirmation: &MessageConfirmation,
        route: EvidenceRoute,
        outbox: &mut Outbox,
    ) -> Result<TransportId> {
        let action = self
            .confirmations
            .create_evidence_action(tenant, confirmation.evidence_type)?;
        let mut evidence = build_evidence_message(business, confirmation, action, route);
        if let Some(id) = id {
            evidence.connector_message_id = id;
        }
        self.submit(tenant, evidence, outbox).await
    }
}

/// Evidence message transporting `confirmation` for `business`.
///
/// The evidence refers to the business message by its ebms and backend
/// ids. Sent opposite to the business message, it swaps the parties.
pub fn build_evidence_message(
    business: &Message,
    confirmation: &MessageConfirmation,
    action: Action,
    route: EvidenceRoute,
) -> Message {
    let source = &business.details;
    let mut details = source.clone();

    details.ref_to_message_id = source.ebms_message_id.clone();
    details.ref_to_backend_message_id = source.backend_message_id.clone();
    details.ebms_message_id = None;
    details.backend_message_id = None;
    details.caused_by = Some(business.connector_message_id.clone());
    details.action = Some(action);
    details.delivered_to_gateway = None;
    details.delivered_to_backend = None;
    details.confirmed = None;
    details.rejected = None;

    if route == EvidenceRoute::Opposite {
        details.direction = source.direction.revert();
        std::mem::swap(&mut details.from_party, &mut details.to_party);
        std::mem::swap(&mut details.original_sender, &mut details.final_recipient);
    }

    Message::evidence(business.tenant.clone(), details, confirmation.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::domain::{
        EvidenceType, MessageContent, MessageDetails, MessageDirection, Party, Service,
    };
    use crate::evidence::UnsignedEvidenceToolkit;
    use crate::observability::MetricsRegistry;
    use crate::storage::{MemoryStore, Storage};

    fn submitter(store: Arc<MemoryStore>) -> LinkSubmitter {
        let tenants = Arc::new(TenantRegistry::new(Arc::new(ConnectorConfig::single_tenant(
            BusinessDomainId::default_lane(),
            LinkPartnerName::new("backend-a"),
            LinkPartnerName::new("gw"),
        ))));
        let storage: Arc<dyn Storage> = store;
        LinkSubmitter::new(
            tenants.clone(),
            Arc::new(RoutingRuleRegistry::new(tenants.clone(), storage.clone())),
            Arc::new(TransportStateService::new(storage, Arc::new(MetricsRegistry::new()))),
            Arc::new(ConfirmationCreator::new(Arc::new(UnsignedEvidenceToolkit), tenants)),
        )
    }

    fn business(direction: MessageDirection) -> Message {
        let mut details = MessageDetails::new(direction);
        details.ebms_message_id = Some("E1".to_string());
        details.backend_message_id = Some("B1".to_string());
        details.service = Service::new("Test");
        details.from_party = Some(Party::new("gw01"));
        details.to_party = Some(Party::new("gw02"));
        details.original_sender = Some("alice".to_string());
        details.final_recipient = Some("bob".to_string());
        Message::business(
            BusinessDomainId::default_lane(),
            details,
            MessageContent::new("doc.xml", Vec::new()),
        )
    }

    #[test]
    fn test_opposite_evidence_swaps_parties() {
        let msg = business(MessageDirection::GatewayToBackend);
        let confirmation = MessageConfirmation::new(EvidenceType::Delivery, vec![1]);

        let evidence = build_evidence_message(
            &msg,
            &confirmation,
            Action::new("DeliveryNonDeliveryToRecipient"),
            EvidenceRoute::Opposite,
        );

        let d = &evidence.details;
        assert!(evidence.is_evidence_message());
        assert_eq!(d.direction, MessageDirection::BackendToGateway);
        assert_eq!(d.ref_to_message_id.as_deref(), Some("E1"));
        assert_eq!(d.ref_to_backend_message_id.as_deref(), Some("B1"));
        assert!(d.ebms_message_id.is_none());
        assert_eq!(d.caused_by.as_ref(), Some(&msg.connector_message_id));
        assert_eq!(d.from_party.as_ref().map(|p| p.party_id.as_str()), Some("gw02"));
        assert_eq!(d.original_sender.as_deref(), Some("bob"));
        assert_eq!(d.service.name, "Test");
    }

    #[test]
    fn test_same_route_keeps_direction() {
        let msg = business(MessageDirection::GatewayToBackend);
        let confirmation = MessageConfirmation::new(EvidenceType::Delivery, vec![1]);

        let evidence = build_evidence_message(&msg, &confirmation, Action::new("a"), EvidenceRoute::Same);

        assert_eq!(evidence.details.direction, MessageDirection::GatewayToBackend);
        assert_eq!(evidence.details.from_party.as_ref().map(|p| p.party_id.as_str()), Some("gw01"));
    }

    #[tokio::test]
    async fn test_submit_to_default_links() {
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(store.clone());
        let lane = BusinessDomainId::default_lane();
        let mut outbox = Outbox::new();

        submitter
            .submit(&lane, business(MessageDirection::BackendToGateway), &mut outbox)
            .await
            .unwrap();
        submitter
            .submit(&lane, business(MessageDirection::GatewayToBackend), &mut outbox)
            .await
            .unwrap();

        let to_gateway: Vec<_> = outbox.to_target(MessageTarget::Gateway).collect();
        assert_eq!(to_gateway.len(), 1);
        assert_eq!(to_gateway[0].link_partner_name, LinkPartnerName::new("gw"));
        assert_eq!(
            to_gateway[0].message.details.gateway_name,
            Some(LinkPartnerName::new("gw"))
        );

        let to_backend: Vec<_> = outbox.to_target(MessageTarget::Backend).collect();
        assert_eq!(to_backend[0].link_partner_name, LinkPartnerName::new("backend-a"));
        assert_eq!(store.transport_steps().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_confirmation_reuses_id() {
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(store);
        let msg = business(MessageDirection::GatewayToBackend);
        let mut outbox = Outbox::new();

        submitter
            .submit_confirmation(
                &BusinessDomainId::default_lane(),
                Some(ConnectorMessageId::new("trigger-1")),
                &msg,
                &MessageConfirmation::new(EvidenceType::Delivery, vec![1]),
                EvidenceRoute::Opposite,
                &mut outbox,
            )
            .await
            .unwrap();

        let sent = &outbox.outbound[0];
        assert_eq!(sent.target, MessageTarget::Gateway);
        assert_eq!(sent.message.connector_message_id, ConnectorMessageId::new("trigger-1"));
        assert_eq!(
            sent.message.details.action,
            Some(Action::new("DeliveryNonDeliveryToRecipient"))
        );
    }
}
