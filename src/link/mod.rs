//! Link partners: the backends and gateways messages are handed to.
//!
//! Push-style partners are registered in the [`LinkRegistry`] and called
//! by the [`LinkDispatcher`]. Messages for a link without a registered
//! partner stay PENDING until a pull-style partner fetches them through
//! the pending transports of its link and reports their status.

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    LinkPartnerName, MessageError, TransportId, TransportState, TransportStatusUpdate,
};
use crate::error::Result;
use crate::processor::OutboundMessage;
use crate::queue::{MessageQueue, QueueHandler};
use crate::tenant::BusinessDomainContext;
use crate::transport::TransportStateService;

/// A backend or gateway connection that accepts messages.
#[async_trait]
pub trait LinkPartner: Send + Sync {
    fn name(&self) -> &LinkPartnerName;

    /// Hand over one message and report the transport outcome.
    async fn submit(&self, outbound: &OutboundMessage) -> Result<TransportStatusUpdate>;
}

/// Registered push-style link partners by name.
#[derive(Default)]
pub struct LinkRegistry {
    partners: RwLock<AHashMap<LinkPartnerName, Arc<dyn LinkPartner>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partner: Arc<dyn LinkPartner>) {
        info!(link = %partner.name(), "Registered link partner");
        self.partners.write().insert(partner.name().clone(), partner);
    }

    pub fn get(&self, name: &LinkPartnerName) -> Option<Arc<dyn LinkPartner>> {
        self.partners.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<LinkPartnerName> {
        let mut names: Vec<_> = self.partners.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Link partner keeping every message it receives.
///
/// Answers with the configured state; accepted messages get the remote id
/// `remote-<transport id>`.
pub struct RecordingLinkPartner {
    name: LinkPartnerName,
    answer: TransportState,
    received: Mutex<Vec<OutboundMessage>>,
}

impl RecordingLinkPartner {
    pub fn accepting(name: impl Into<String>) -> Self {
        Self::answering(name, TransportState::Accepted)
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self::answering(name, TransportState::Failed)
    }

    pub fn answering(name: impl Into<String>, answer: TransportState) -> Self {
        RecordingLinkPartner {
            name: LinkPartnerName::new(name),
            answer,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<OutboundMessage> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl LinkPartner for RecordingLinkPartner {
    fn name(&self) -> &LinkPartnerName {
        &self.name
    }

    async fn submit(&self, outbound: &OutboundMessage) -> Result<TransportStatusUpdate> {
        self.received.lock().push(outbound.clone());
        Ok(match self.answer {
            TransportState::Accepted => {
                TransportStatusUpdate::accepted(format!("remote-{}", outbound.transport_id))
            }
            TransportState::Failed => TransportStatusUpdate::failed(vec![MessageError::new(
                self.name.as_str(),
                "rejected by link partner",
            )]),
            state => TransportStatusUpdate::new(state),
        })
    }
}

/// Consumer of the outbound queue.
///
/// Calls the link partner, records the answer on the transport step and
/// retries failed transports with a new attempt while the message is
/// retry eligible and attempts are left.
pub struct LinkDispatcher {
    links: Arc<LinkRegistry>,
    transports: Arc<TransportStateService>,
    to_link: Arc<dyn MessageQueue<OutboundMessage>>,
    max_attempts: u32,
}

impl LinkDispatcher {
    pub fn new(
        links: Arc<LinkRegistry>,
        transports: Arc<TransportStateService>,
        to_link: Arc<dyn MessageQueue<OutboundMessage>>,
        max_attempts: u32,
    ) -> Self {
        LinkDispatcher {
            links,
            transports,
            to_link,
            max_attempts,
        }
    }

    /// Record a status report and schedule a retry if the transport failed.
    ///
    /// Only the report that moves a step into FAILED schedules a retry;
    /// repeated reports for the same transport are recorded and ignored.
    /// Returns the transport id of the retry, if one was scheduled.
    pub async fn record_status(
        &self,
        transport_id: &TransportId,
        update: TransportStatusUpdate,
    ) -> Result<Option<TransportId>> {
        let failed = update.state == TransportState::Failed;
        let first_final = self.transports.update_transport_status(transport_id, update).await?;
        if !failed || !first_final {
            return Ok(None);
        }
        self.retry(transport_id).await
    }

    async fn retry(&self, transport_id: &TransportId) -> Result<Option<TransportId>> {
        let Some(step) = self.transports.get_transport_step(transport_id).await? else {
            return Ok(None);
        };
        let attempts = self
            .transports
            .attempts_made(&step.connector_message_id, &step.link_partner_name)
            .await?;
        if attempts >= self.max_attempts {
            warn!(
                transport_id = %transport_id,
                attempts = attempts,
                "Transport failed, no attempts left"
            );
            return Ok(None);
        }
        if !self.transports.is_retry_eligible(&step).await {
            info!(transport_id = %transport_id, "Transport failed, message not eligible for retry");
            return Ok(None);
        }
        let Some(message) = step.transported_message else {
            return Ok(None);
        };

        let link = step.link_partner_name;
        let retry_id = self.transports.create_transport_for(&message, &link).await?;
        info!(
            transport_id = %transport_id,
            retry_transport_id = %retry_id,
            link = %link,
            "Retrying failed transport"
        );

        self.to_link
            .publish(OutboundMessage {
                transport_id: retry_id.clone(),
                link_partner_name: link,
                target: message.direction().target(),
                message,
            })
            .await?;
        Ok(Some(retry_id))
    }
}

#[async_trait]
impl QueueHandler<OutboundMessage> for LinkDispatcher {
    async fn handle(&self, outbound: &OutboundMessage) -> Result<()> {
        BusinessDomainContext::scope(outbound.message.tenant.clone(), async {
            let Some(partner) = self.links.get(&outbound.link_partner_name) else {
                debug!(
                    transport_id = %outbound.transport_id,
                    link = %outbound.link_partner_name,
                    "No push link partner registered, transport left pending"
                );
                return Ok(());
            };

            // Units of work publish before they commit; wait for the step.
            if self.transports.get_transport_step(&outbound.transport_id).await?.is_none() {
                return Err(anyhow::anyhow!(
                    "transport step {} is not stored yet",
                    outbound.transport_id
                )
                .into());
            }

            let update = match partner.submit(outbound).await {
                Ok(update) => update,
                Err(e) => TransportStatusUpdate::failed(vec![MessageError::new(
                    outbound.link_partner_name.as_str(),
                    e.to_string(),
                )]),
            };
            self.record_status(&outbound.transport_id, update).await?;
            Ok(())
        })
        .await
    }
}
