//! Queues between the connector's units of work.
//!
//! Three logical queues exist: inbound messages for the controller,
//! outbound messages for the link partners, and finished business
//! messages for cleanup. Delivery is at least once: a handler error nacks
//! the delivery and it comes back until the redelivery limit moves it to
//! the dead letter list.

pub mod consumer;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::domain::{ConnectorMessageId, Message};
use crate::error::Result;
use crate::processor::OutboundMessage;

pub use consumer::{run_consumer, QueueHandler};
pub use memory::MemoryQueue;

/// One delivery of a queued payload.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub delivery_id: u64,
    /// 1 on first delivery
    pub delivery_count: u32,
    pub payload: T,
}

/// A payload that exhausted its deliveries or could not be processed.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub payload: T,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue with explicit acknowledgement.
#[async_trait]
pub trait MessageQueue<T: Send + 'static>: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, payload: T) -> Result<()>;

    /// Wait for the next delivery. `None` once the queue is closed and drained.
    async fn receive(&self) -> Option<Delivery<T>>;

    async fn ack(&self, delivery: Delivery<T>) -> Result<()>;

    /// Return a delivery for redelivery, or dead letter it when the
    /// redelivery limit is reached.
    async fn nack(&self, delivery: Delivery<T>, reason: &str) -> Result<()>;

    /// Move a delivery to the dead letter list without retrying.
    async fn dead_letter(&self, delivery: Delivery<T>, reason: &str) -> Result<()>;
}

/// The connector's three queues.
#[derive(Clone)]
pub struct ConnectorQueues {
    pub to_controller: Arc<dyn MessageQueue<Message>>,
    pub to_link: Arc<dyn MessageQueue<OutboundMessage>>,
    pub to_cleanup: Arc<dyn MessageQueue<ConnectorMessageId>>,
}

impl ConnectorQueues {
    /// In-memory queues sharing one redelivery policy.
    pub fn in_memory(max_redeliveries: u32, redelivery_delay: std::time::Duration) -> Self {
        ConnectorQueues {
            to_controller: Arc::new(MemoryQueue::new("to-controller", max_redeliveries, redelivery_delay)),
            to_link: Arc::new(MemoryQueue::new("to-link", max_redeliveries, redelivery_delay)),
            to_cleanup: Arc::new(MemoryQueue::new("to-cleanup", max_redeliveries, redelivery_delay)),
        }
    }
}
