use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};

use super::{DeadLetter, Delivery, MessageQueue};

/// In-process queue backed by an unbounded tokio channel.
///
/// Nacked deliveries are re-enqueued after `redelivery_delay`. A delivery
/// nacked after `max_redeliveries` redeliveries goes to the dead letter list.
pub struct MemoryQueue<T> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery<T>>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery<T>>>,
    next_id: AtomicU64,
    /// Published or re-enqueued but not yet received
    queued: Arc<AtomicUsize>,
    max_redeliveries: u32,
    redelivery_delay: Duration,
    dead_letters: Mutex<Vec<DeadLetter<T>>>,
}

impl<T: Clone + Send + 'static> MemoryQueue<T> {
    pub fn new(name: impl Into<String>, max_redeliveries: u32, redelivery_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MemoryQueue {
            name: name.into(),
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            next_id: AtomicU64::new(1),
            queued: Arc::new(AtomicUsize::new(0)),
            max_redeliveries,
            redelivery_delay,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Number of deliveries waiting to be received.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the next delivery if one is waiting.
    pub fn try_receive(&self) -> Option<Delivery<T>> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let delivery = receiver.try_recv().ok()?;
        Some(self.received(delivery))
    }

    /// Receive and acknowledge everything waiting, returning the payloads.
    pub fn drain(&self) -> Vec<T> {
        let mut payloads = Vec::new();
        while let Some(delivery) = self.try_receive() {
            payloads.push(delivery.payload);
        }
        payloads
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter<T>> {
        self.dead_letters.lock().clone()
    }

    /// Stop accepting payloads. Receivers get `None` once drained.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Delivery<T>>> {
        self.sender
            .lock()
            .clone()
            .ok_or_else(|| ConnectorError::Queue(format!("queue {} is closed", self.name)))
    }

    fn enqueue(&self, delivery: Delivery<T>) -> Result<()> {
        self.sender()?
            .send(delivery)
            .map_err(|_| ConnectorError::Queue(format!("queue {} is closed", self.name)))?;
        self.queued.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn received(&self, mut delivery: Delivery<T>) -> Delivery<T> {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        delivery.delivery_count += 1;
        delivery
    }

    fn push_dead_letter(&self, delivery: Delivery<T>, reason: &str) {
        warn!(
            queue = %self.name,
            delivery_id = delivery.delivery_id,
            delivery_count = delivery.delivery_count,
            reason = reason,
            "Moved to dead letter queue"
        );
        self.dead_letters.lock().push(DeadLetter {
            payload: delivery.payload,
            delivery_count: delivery.delivery_count,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageQueue<T> for MemoryQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: T) -> Result<()> {
        let delivery = Delivery {
            delivery_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            delivery_count: 0,
            payload,
        };
        self.enqueue(delivery)
    }

    async fn receive(&self) -> Option<Delivery<T>> {
        let delivery = self.receiver.lock().await.recv().await?;
        Some(self.received(delivery))
    }

    async fn ack(&self, delivery: Delivery<T>) -> Result<()> {
        debug!(queue = %self.name, delivery_id = delivery.delivery_id, "Acknowledged");
        Ok(())
    }

    async fn nack(&self, delivery: Delivery<T>, reason: &str) -> Result<()> {
        if delivery.delivery_count > self.max_redeliveries {
            self.push_dead_letter(delivery, reason);
            return Ok(());
        }

        debug!(
            queue = %self.name,
            delivery_id = delivery.delivery_id,
            delivery_count = delivery.delivery_count,
            "Scheduling redelivery"
        );

        if self.redelivery_delay.is_zero() {
            return self.enqueue(delivery);
        }

        let sender = self.sender()?;
        let queued = self.queued.clone();
        let delay = self.redelivery_delay;
        let name = self.name.clone();
        queued.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(delivery).is_err() {
                queued.fetch_sub(1, Ordering::AcqRel);
                warn!(queue = %name, "Queue closed before redelivery");
            }
        });
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery<T>, reason: &str) -> Result<()> {
        self.push_dead_letter(delivery, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let queue = MemoryQueue::new("q", 3, Duration::ZERO);
        queue.publish("a".to_string()).await.unwrap();
        queue.publish("b".to_string()).await.unwrap();
        assert_eq!(queue.len(), 2);

        let first = queue.receive().await.unwrap();
        assert_eq!(first.payload, "a");
        assert_eq!(first.delivery_count, 1);
        queue.ack(first).await.unwrap();

        assert_eq!(queue.drain(), vec!["b".to_string()]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue = MemoryQueue::new("q", 2, Duration::ZERO);
        queue.publish(7u32).await.unwrap();

        for expected_count in 1..=3 {
            let delivery = queue.try_receive().unwrap();
            assert_eq!(delivery.delivery_count, expected_count);
            queue.nack(delivery, "boom").await.unwrap();
        }

        assert!(queue.try_receive().is_none());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, 7);
        assert_eq!(dead[0].delivery_count, 3);
        assert_eq!(dead[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_delayed_redelivery() {
        let queue = MemoryQueue::new("q", 5, Duration::from_millis(20));
        queue.publish(1u32).await.unwrap();

        let delivery = queue.receive().await.unwrap();
        queue.nack(delivery, "later").await.unwrap();
        assert!(queue.try_receive().is_none());

        let again = tokio::time::timeout(Duration::from_secs(1), queue.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_directly() {
        let queue = MemoryQueue::new("q", 5, Duration::ZERO);
        queue.publish(1u32).await.unwrap();
        let delivery = queue.receive().await.unwrap();
        queue.dead_letter(delivery, "not correlatable").await.unwrap();

        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.dead_letters()[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let queue = MemoryQueue::new("q", 5, Duration::ZERO);
        queue.publish(1u32).await.unwrap();
        queue.close();

        assert!(queue.publish(2).await.is_err());
        assert!(queue.receive().await.is_some());
        assert!(queue.receive().await.is_none());
    }
}
