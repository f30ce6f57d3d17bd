use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{ConnectorMessageId, LinkPartnerName, Message, MessageTarget, TransportId};
use crate::error::Result;
use crate::queue::ConnectorQueues;

/// A message handed to a link partner under a transport step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub transport_id: TransportId,
    pub link_partner_name: LinkPartnerName,
    pub target: MessageTarget,
    pub message: Message,
}

/// Queue writes of one unit of work.
///
/// Nothing leaves the unit of work before it succeeded: processors only
/// fill the outbox and the consumer publishes it afterwards.
#[derive(Debug, Default)]
pub struct Outbox {
    pub outbound: Vec<OutboundMessage>,
    pub cleanup: Vec<ConnectorMessageId>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outbound: OutboundMessage) {
        self.outbound.push(outbound);
    }

    /// Schedule a finished business message for cleanup, once.
    pub fn cleanup(&mut self, id: ConnectorMessageId) {
        if !self.cleanup.contains(&id) {
            self.cleanup.push(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.cleanup.is_empty()
    }

    /// Outbound messages for one side of the connector.
    pub fn to_target(&self, target: MessageTarget) -> impl Iterator<Item = &OutboundMessage> {
        self.outbound.iter().filter(move |o| o.target == target)
    }
}

/// Publishes outboxes to the connector queues.
#[derive(Clone)]
pub struct OutboxPublisher {
    queues: ConnectorQueues,
}

impl OutboxPublisher {
    pub fn new(queues: ConnectorQueues) -> Self {
        OutboxPublisher { queues }
    }

    pub async fn publish(&self, outbox: Outbox) -> Result<()> {
        for outbound in outbox.outbound {
            debug!(
                transport_id = %outbound.transport_id,
                link = %outbound.link_partner_name,
                "Publishing outbound message"
            );
            self.queues.to_link.publish(outbound).await?;
        }
        for id in outbox.cleanup {
            self.queues.to_cleanup.publish(id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BusinessDomainId, MessageContent, MessageDetails, MessageDirection,
    };
    use crate::queue::MessageQueue;
    use std::time::Duration;

    fn outbound(target: MessageTarget) -> OutboundMessage {
        let message = Message::business(
            BusinessDomainId::default_lane(),
            MessageDetails::new(MessageDirection::BackendToGateway),
            MessageContent::new("doc.xml", Vec::new()),
        );
        let link = LinkPartnerName::new("gw");
        OutboundMessage {
            transport_id: TransportId::for_attempt(&message.connector_message_id, &link, 1),
            link_partner_name: link,
            target,
            message,
        }
    }

    #[test]
    fn test_cleanup_is_deduplicated() {
        let mut outbox = Outbox::new();
        assert!(outbox.is_empty());

        outbox.cleanup(ConnectorMessageId::new("m1"));
        outbox.cleanup(ConnectorMessageId::new("m1"));
        assert_eq!(outbox.cleanup.len(), 1);
        assert!(!outbox.is_empty());
    }

    #[tokio::test]
    async fn test_publish_routes_to_queues() {
        let queues = ConnectorQueues::in_memory(1, Duration::ZERO);
        let publisher = OutboxPublisher::new(queues.clone());

        let mut outbox = Outbox::new();
        outbox.push(outbound(MessageTarget::Gateway));
        outbox.push(outbound(MessageTarget::Backend));
        outbox.cleanup(ConnectorMessageId::new("m1"));
        assert_eq!(outbox.to_target(MessageTarget::Gateway).count(), 1);

        publisher.publish(outbox).await.unwrap();

        let first = queues.to_link.receive().await.unwrap();
        assert_eq!(first.payload.target, MessageTarget::Gateway);
        let second = queues.to_link.receive().await.unwrap();
        assert_eq!(second.payload.target, MessageTarget::Backend);
        let cleanup = queues.to_cleanup.receive().await.unwrap();
        assert_eq!(cleanup.payload, ConnectorMessageId::new("m1"));
    }
}
