use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::observability::MetricsRegistry;

use super::MessageQueue;

/// Unit of work run for every delivery of a queue.
#[async_trait]
pub trait QueueHandler<T>: Send + Sync {
    async fn handle(&self, payload: &T) -> Result<()>;
}

/// Consume `queue` until it is closed or `shutdown` turns true.
///
/// A successful unit of work is acked. A failed one is nacked for
/// redelivery if the error is retryable and dead lettered otherwise.
pub async fn run_consumer<T, H>(
    queue: Arc<dyn MessageQueue<T>>,
    handler: Arc<H>,
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: Send + Sync + 'static,
    H: QueueHandler<T> + ?Sized,
{
    info!(queue = queue.name(), "Consumer started");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            delivery = queue.receive() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let start = Instant::now();
        let result = handler.handle(&delivery.payload).await;
        metrics.record_message(result.is_ok(), start);

        let settled = match result {
            Ok(()) => queue.ack(delivery).await,
            Err(e) if e.is_retryable() => {
                warn!(
                    queue = queue.name(),
                    delivery_id = delivery.delivery_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Unit of work failed, message will be redelivered"
                );
                queue.nack(delivery, &e.to_string()).await
            }
            Err(e) => {
                error!(
                    queue = queue.name(),
                    delivery_id = delivery.delivery_id,
                    error = %e,
                    "Unit of work failed permanently"
                );
                metrics.record_dead_letter();
                queue.dead_letter(delivery, &e.to_string()).await
            }
        };

        if let Err(e) = settled {
            error!(queue = queue.name(), error = %e, "Could not settle delivery");
        }
    }

    debug!(queue = queue.name(), "Consumer stopped");
}
