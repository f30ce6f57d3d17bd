//! Evidence timeouts of business messages sent to the gateway.
//!
//! A message handed to the gateway waits for a relay evidence and then a
//! delivery evidence. When one does not arrive in time the connector
//! issues the negative evidence itself.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EvidenceConfig;
use crate::domain::{BusinessDomainId, EvidenceType, Message, MessageDirection, RejectionReason};
use crate::error::Result;
use crate::observability::MetricsRegistry;
use crate::processor::{Outbox, OutboxPublisher};
use crate::storage::Storage;
use crate::tenant::TenantRegistry;

use super::confirmation::ConfirmationCreator;
use super::processor::EvidenceProcessor;

/// Timeouts of one tenant. `None` disables a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidenceTimeouts {
    pub relay: Option<Duration>,
    pub relay_warn: Option<Duration>,
    pub delivery: Option<Duration>,
    pub delivery_warn: Option<Duration>,
}

impl EvidenceTimeouts {
    pub fn from_config(config: &EvidenceConfig) -> Self {
        fn secs(value: u64) -> Option<Duration> {
            (value > 0).then(|| Duration::seconds(value as i64))
        }

        EvidenceTimeouts {
            relay: secs(config.relay_timeout_secs),
            relay_warn: secs(config.relay_warn_timeout_secs),
            delivery: secs(config.delivery_timeout_secs),
            delivery_warn: secs(config.delivery_warn_timeout_secs),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.relay.is_none()
            && self.relay_warn.is_none()
            && self.delivery.is_none()
            && self.delivery_warn.is_none()
    }
}

/// Outcome of checking one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    Ok,
    /// The warn limit for `awaiting` has passed
    Warn { awaiting: EvidenceType, elapsed: Duration },
    /// Negative evidence `evidence_type` has to be generated
    Expired {
        evidence_type: EvidenceType,
        reason: RejectionReason,
    },
}

/// Decide whether a business message waited too long for evidence.
///
/// Only messages sent to the gateway, delivered and neither confirmed nor
/// rejected are checked. The relay timeout is checked before the delivery
/// timeout; an expiry wins over a warning.
pub fn check_timeout(message: &Message, now: DateTime<Utc>, timeouts: &EvidenceTimeouts) -> TimeoutVerdict {
    if !message.is_business_message()
        || message.direction() != MessageDirection::BackendToGateway
        || message.details.is_confirmed_or_rejected()
    {
        return TimeoutVerdict::Ok;
    }
    let Some(delivered) = message.details.delivered_to_gateway else {
        return TimeoutVerdict::Ok;
    };

    let elapsed = now - delivered;
    let highest = message.highest_evidence_priority();
    let awaiting_relay = highest < EvidenceType::RelayRemmdAcceptance.priority();
    let awaiting_delivery = highest < EvidenceType::Delivery.priority();

    let passed = |limit: Option<Duration>| limit.map(|l| elapsed >= l).unwrap_or(false);

    if awaiting_relay && passed(timeouts.relay) {
        return TimeoutVerdict::Expired {
            evidence_type: EvidenceType::RelayRemmdFailure,
            reason: RejectionReason::RelayEvidenceTimeout,
        };
    }
    if awaiting_delivery && passed(timeouts.delivery) {
        return TimeoutVerdict::Expired {
            evidence_type: EvidenceType::NonDelivery,
            reason: RejectionReason::DeliveryEvidenceTimeout,
        };
    }
    if awaiting_relay && passed(timeouts.relay_warn) {
        return TimeoutVerdict::Warn {
            awaiting: EvidenceType::RelayRemmdAcceptance,
            elapsed,
        };
    }
    if awaiting_delivery && passed(timeouts.delivery_warn) {
        return TimeoutVerdict::Warn {
            awaiting: EvidenceType::Delivery,
            elapsed,
        };
    }
    TimeoutVerdict::Ok
}

/// Counts of one timeout run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutReport {
    pub checked: usize,
    pub warned: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Generates negative evidence for messages whose timeout expired.
pub struct EvidenceTimeoutProcessor {
    storage: Arc<dyn Storage>,
    tenants: Arc<TenantRegistry>,
    confirmations: Arc<ConfirmationCreator>,
    evidence: Arc<EvidenceProcessor>,
    publisher: OutboxPublisher,
    metrics: Arc<MetricsRegistry>,
}

impl EvidenceTimeoutProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        tenants: Arc<TenantRegistry>,
        confirmations: Arc<ConfirmationCreator>,
        evidence: Arc<EvidenceProcessor>,
        publisher: OutboxPublisher,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        EvidenceTimeoutProcessor {
            storage,
            tenants,
            confirmations,
            evidence,
            publisher,
            metrics,
        }
    }

    /// Issue `evidence_type` for `business` and send it to the backend.
    pub async fn handle_expired(
        &self,
        tenant: &BusinessDomainId,
        business: Message,
        evidence_type: EvidenceType,
        reason: RejectionReason,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let confirmation = self
            .confirmations
            .create_timeout_confirmation(evidence_type, &business, reason)
            .await?;
        self.metrics.record_evidence_created();
        self.metrics.record_evidence_timeout();

        warn!(
            tenant = %tenant,
            connector_message_id = %business.connector_message_id,
            evidence_type = %evidence_type,
            reason = reason.as_str(),
            "Evidence timeout expired, rejecting message"
        );

        self.evidence
            .apply_confirmation(tenant, business, confirmation, None, false, outbox)
            .await
    }

    /// Run [`EvidenceTimeoutProcessor::handle_expired`] as one unit of
    /// work. On failure nothing is kept and the next run tries again.
    async fn expire(
        &self,
        tenant: &BusinessDomainId,
        business: Message,
        evidence_type: EvidenceType,
        reason: RejectionReason,
    ) -> Result<()> {
        let unit = self.storage.begin().await?;
        unit.run(async {
            let mut outbox = Outbox::new();
            self.handle_expired(tenant, business, evidence_type, reason, &mut outbox)
                .await?;
            self.publisher.publish(outbox).await
        })
        .await
    }

    /// Check every message of `tenant` waiting for evidence.
    ///
    /// A failing message is logged and does not stop the run.
    pub async fn check_timeouts(&self, tenant: &BusinessDomainId, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let state = self.tenants.get(tenant)?;
        let timeouts = EvidenceTimeouts::from_config(&state.config.evidence);
        let mut report = TimeoutReport::default();
        if timeouts.is_disabled() {
            return Ok(report);
        }

        let candidates = self
            .storage
            .find_messages_awaiting_evidence(tenant, EvidenceType::Delivery.priority())
            .await?;

        for message in candidates {
            report.checked += 1;
            match check_timeout(&message, now, &timeouts) {
                TimeoutVerdict::Ok => {}
                TimeoutVerdict::Warn { awaiting, elapsed } => {
                    report.warned += 1;
                    warn!(
                        tenant = %tenant,
                        connector_message_id = %message.connector_message_id,
                        awaiting = %awaiting,
                        elapsed_secs = elapsed.num_seconds(),
                        "Evidence is late"
                    );
                }
                TimeoutVerdict::Expired { evidence_type, reason } => {
                    let id = message.connector_message_id.clone();
                    match self.expire(tenant, message, evidence_type, reason).await {
                        Ok(()) => report.expired += 1,
                        Err(e) => {
                            report.failed += 1;
                            error!(tenant = %tenant, connector_message_id = %id, error = %e, "Timeout handling failed");
                        }
                    }
                }
            }
        }

        debug!(tenant = %tenant, ?report, "Evidence timeout check finished");
        Ok(report)
    }

    /// Check all enabled tenants every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Evidence timeout checker started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    for tenant in self.tenants.tenant_ids() {
                        if let Err(e) = self.check_timeouts(&tenant, Utc::now()).await {
                            error!(tenant = %tenant, error = %e, "Evidence timeout check failed");
                        }
                    }
                }
            }
        }

        debug!("Evidence timeout checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageConfirmation, MessageContent, MessageDetails};

    fn timeouts() -> EvidenceTimeouts {
        EvidenceTimeouts {
            relay: Some(Duration::minutes(60)),
            relay_warn: Some(Duration::minutes(30)),
            delivery: Some(Duration::minutes(120)),
            delivery_warn: Some(Duration::minutes(90)),
        }
    }

    fn delivered(minutes_ago: i64, now: DateTime<Utc>) -> Message {
        let mut details = MessageDetails::new(MessageDirection::BackendToGateway);
        details.delivered_to_gateway = Some(now - Duration::minutes(minutes_ago));
        Message::business(
            BusinessDomainId::default_lane(),
            details,
            MessageContent::new("doc.xml", Vec::new()),
        )
    }

    #[test]
    fn test_zero_disables() {
        let config = EvidenceConfig {
            relay_timeout_secs: 0,
            relay_warn_timeout_secs: 0,
            delivery_timeout_secs: 0,
            delivery_warn_timeout_secs: 0,
            ..Default::default()
        };
        assert!(EvidenceTimeouts::from_config(&config).is_disabled());
        assert!(!EvidenceTimeouts::from_config(&EvidenceConfig::default()).is_disabled());
    }

    #[test]
    fn test_relay_expiry_wins() {
        let now = Utc::now();
        let msg = delivered(200, now);

        assert_eq!(
            check_timeout(&msg, now, &timeouts()),
            TimeoutVerdict::Expired {
                evidence_type: EvidenceType::RelayRemmdFailure,
                reason: RejectionReason::RelayEvidenceTimeout,
            }
        );
    }

    #[test]
    fn test_delivery_expiry_after_relay() {
        let now = Utc::now();
        let mut msg = delivered(200, now);
        msg.related_confirmations
            .push(MessageConfirmation::new(EvidenceType::RelayRemmdAcceptance, vec![1]));

        assert_eq!(
            check_timeout(&msg, now, &timeouts()),
            TimeoutVerdict::Expired {
                evidence_type: EvidenceType::NonDelivery,
                reason: RejectionReason::DeliveryEvidenceTimeout,
            }
        );
    }

    #[test]
    fn test_warn_before_expiry() {
        let now = Utc::now();
        let msg = delivered(45, now);

        assert!(matches!(
            check_timeout(&msg, now, &timeouts()),
            TimeoutVerdict::Warn {
                awaiting: EvidenceType::RelayRemmdAcceptance,
                ..
            }
        ));
        assert_eq!(check_timeout(&delivered(10, now), now, &timeouts()), TimeoutVerdict::Ok);
    }

    #[test]
    fn test_finished_or_undelivered_messages_are_ok() {
        let now = Utc::now();

        let mut confirmed = delivered(500, now);
        confirmed.details.confirmed = Some(now);
        assert_eq!(check_timeout(&confirmed, now, &timeouts()), TimeoutVerdict::Ok);

        let mut undelivered = delivered(500, now);
        undelivered.details.delivered_to_gateway = None;
        assert_eq!(check_timeout(&undelivered, now, &timeouts()), TimeoutVerdict::Ok);

        let mut inbound = delivered(500, now);
        inbound.details.direction = MessageDirection::GatewayToBackend;
        assert_eq!(check_timeout(&inbound, now, &timeouts()), TimeoutVerdict::Ok);
    }
}
