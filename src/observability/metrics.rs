use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::domain::TransportState;
use crate::evidence::ConfirmationOutcome;

/// Metrics registry for the connector.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Units of work by outcome
    pub messages_processed_total: AtomicU64,
    pub messages_failed_total: AtomicU64,
    pub messages_dead_lettered_total: AtomicU64,

    /// Unit of work latency buckets
    pub latency_under_10ms: AtomicU64,
    pub latency_10_100ms: AtomicU64,
    pub latency_100ms_1s: AtomicU64,
    pub latency_over_1s: AtomicU64,

    /// Evidences generated by the connector
    pub evidences_created_total: AtomicU64,
    /// Evidences that changed nothing (duplicate, lower priority, already rejected)
    pub evidences_not_relevant_total: AtomicU64,
    pub evidence_timeouts_total: AtomicU64,

    /// Transport bookkeeping
    pub transport_steps_created_total: AtomicU64,
    pub transport_updates_pending: AtomicU64,
    pub transport_updates_accepted: AtomicU64,
    pub transport_updates_failed: AtomicU64,

    /// Configuration reloads
    pub config_reloads_total: AtomicU64,
    pub config_reload_errors: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Record the outcome of one unit of work.
    pub fn record_message(&self, success: bool, start: Instant) {
        if success {
            self.messages_processed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_failed_total.fetch_add(1, Ordering::Relaxed);
        }

        let millis = start.elapsed().as_millis() as u64;
        let bucket = if millis < 10 {
            &self.latency_under_10ms
        } else if millis < 100 {
            &self.latency_10_100ms
        } else if millis < 1000 {
            &self.latency_100ms_1s
        } else {
            &self.latency_over_1s
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.messages_dead_lettered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evidence_created(&self) {
        self.evidences_created_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a confirmation affected its business message.
    pub fn record_confirmation(&self, outcome: &ConfirmationOutcome) {
        if !outcome.is_relevant() {
            self.evidences_not_relevant_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evidence_timeout(&self) {
        self.evidence_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_step_created(&self) {
        self.transport_steps_created_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport status report.
    pub fn record_transport_update(&self, state: TransportState) {
        let counter = match state {
            TransportState::Pending | TransportState::PendingDownloaded => {
                &self.transport_updates_pending
            }
            TransportState::Accepted => &self.transport_updates_accepted,
            TransportState::Failed => &self.transport_updates_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a configuration reload.
    pub fn record_config_reload(&self, success: bool) {
        self.config_reloads_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.config_reload_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP lanebridge_messages_total Units of work by outcome
# TYPE lanebridge_messages_total counter
lanebridge_messages_total{{outcome="processed"}} {}
lanebridge_messages_total{{outcome="failed"}} {}
lanebridge_messages_total{{outcome="dead_lettered"}} {}

# HELP lanebridge_message_latency_bucket Unit of work latency histogram
# TYPE lanebridge_message_latency_bucket counter
lanebridge_message_latency_bucket{{le="0.01"}} {}
lanebridge_message_latency_bucket{{le="0.1"}} {}
lanebridge_message_latency_bucket{{le="1"}} {}
lanebridge_message_latency_bucket{{le="+Inf"}} {}

# HELP lanebridge_evidences_created_total Evidences generated
# TYPE lanebridge_evidences_created_total counter
lanebridge_evidences_created_total {}

# HELP lanebridge_evidences_not_relevant_total Evidences that did not change message state
# TYPE lanebridge_evidences_not_relevant_total counter
lanebridge_evidences_not_relevant_total {}

# HELP lanebridge_evidence_timeouts_total Negative evidences generated by timeout
# TYPE lanebridge_evidence_timeouts_total counter
lanebridge_evidence_timeouts_total {}

# HELP lanebridge_transport_steps_created_total Transport attempts created
# TYPE lanebridge_transport_steps_created_total counter
lanebridge_transport_steps_created_total {}

# HELP lanebridge_transport_updates_total Transport status reports by state
# TYPE lanebridge_transport_updates_total counter
lanebridge_transport_updates_total{{state="pending"}} {}
lanebridge_transport_updates_total{{state="accepted"}} {}
lanebridge_transport_updates_total{{state="failed"}} {}

# HELP lanebridge_config_reloads_total Configuration reload operations
# TYPE lanebridge_config_reloads_total counter
lanebridge_config_reloads_total {}

# HELP lanebridge_config_reload_errors_total Configuration reload errors
# TYPE lanebridge_config_reload_errors_total counter
lanebridge_config_reload_errors_total {}
"#,
            self.messages_processed_total.load(Ordering::Relaxed),
            self.messages_failed_total.load(Ordering::Relaxed),
            self.messages_dead_lettered_total.load(Ordering::Relaxed),
            self.latency_under_10ms.load(Ordering::Relaxed),
            self.latency_10_100ms.load(Ordering::Relaxed),
            self.latency_100ms_1s.load(Ordering::Relaxed),
            self.latency_over_1s.load(Ordering::Relaxed),
            self.evidences_created_total.load(Ordering::Relaxed),
            self.evidences_not_relevant_total.load(Ordering::Relaxed),
            self.evidence_timeouts_total.load(Ordering::Relaxed),
            self.transport_steps_created_total.load(Ordering::Relaxed),
            self.transport_updates_pending.load(Ordering::Relaxed),
            self.transport_updates_accepted.load(Ordering::Relaxed),
            self.transport_updates_failed.load(Ordering::Relaxed),
            self.config_reloads_total.load(Ordering::Relaxed),
            self.config_reload_errors.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::NotRelevant;

    #[test]
    fn test_record_message() {
        let metrics = MetricsRegistry::new();

        metrics.record_message(true, Instant::now());
        metrics.record_message(true, Instant::now());
        metrics.record_message(false, Instant::now());

        assert_eq!(metrics.messages_processed_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.messages_failed_total.load(Ordering::Relaxed), 1);
        assert!(metrics.latency_under_10ms.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_record_transport_update() {
        let metrics = MetricsRegistry::new();

        metrics.record_transport_update(TransportState::Pending);
        metrics.record_transport_update(TransportState::PendingDownloaded);
        metrics.record_transport_update(TransportState::Failed);

        assert_eq!(metrics.transport_updates_pending.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.transport_updates_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.transport_updates_accepted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_not_relevant_confirmations_counted() {
        let metrics = MetricsRegistry::new();

        metrics.record_confirmation(&ConfirmationOutcome::Confirmed);
        metrics.record_confirmation(&ConfirmationOutcome::NotRelevant(NotRelevant::Duplicate));

        assert_eq!(metrics.evidences_not_relevant_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = MetricsRegistry::new();
        metrics.record_message(true, Instant::now());
        metrics.record_transport_update(TransportState::Accepted);

        let output = metrics.to_prometheus();

        assert!(output.contains("lanebridge_messages_total{outcome=\"processed\"} 1"));
        assert!(output.contains("lanebridge_transport_updates_total{state=\"accepted\"} 1"));
    }
}
