use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConnectorConfig;
use crate::evidence::{
    ConfirmationCreator, ConfirmationRecorder, EvidenceProcessor, EvidenceTimeoutProcessor,
    EvidenceToolkit,
};
use crate::link::{LinkDispatcher, LinkRegistry};
use crate::observability::MetricsRegistry;
use crate::processor::{
    CleanupHandler, LinkSubmitter, MessageListener, OutboxPublisher, ToBackendProcessor,
    ToGatewayProcessor,
};
use crate::queue::{run_consumer, ConnectorQueues};
use crate::routing::RoutingRuleRegistry;
use crate::storage::Storage;
use crate::tenant::TenantRegistry;
use crate::transport::TransportStateService;

/// The connector's services, wired over one store and one set of queues.
pub struct Connector {
    pub storage: Arc<dyn Storage>,
    pub tenants: Arc<TenantRegistry>,
    pub routing: Arc<RoutingRuleRegistry>,
    pub transports: Arc<TransportStateService>,
    pub evidence: Arc<EvidenceProcessor>,
    pub timeouts: Arc<EvidenceTimeoutProcessor>,
    pub listener: Arc<MessageListener>,
    pub dispatcher: Arc<LinkDispatcher>,
    pub cleanup: Arc<CleanupHandler>,
    pub links: Arc<LinkRegistry>,
    pub queues: ConnectorQueues,
    pub metrics: Arc<MetricsRegistry>,
}

impl Connector {
    pub fn new(
        config: Arc<ConnectorConfig>,
        storage: Arc<dyn Storage>,
        toolkit: Arc<dyn EvidenceToolkit>,
        queues: ConnectorQueues,
        metrics: Arc<MetricsRegistry>,
        max_transport_attempts: u32,
    ) -> Self {
        let tenants = Arc::new(TenantRegistry::new(config));
        let routing = Arc::new(RoutingRuleRegistry::new(tenants.clone(), storage.clone()));
        let transports = Arc::new(TransportStateService::new(storage.clone(), metrics.clone()));
        let confirmations = Arc::new(ConfirmationCreator::new(toolkit, tenants.clone()));
        let recorder = Arc::new(ConfirmationRecorder::new(storage.clone()));
        let submitter = Arc::new(LinkSubmitter::new(
            tenants.clone(),
            routing.clone(),
            transports.clone(),
            confirmations.clone(),
        ));
        let publisher = OutboxPublisher::new(queues.clone());

        let evidence = Arc::new(EvidenceProcessor::new(
            storage.clone(),
            tenants.clone(),
            confirmations.clone(),
            recorder.clone(),
            submitter.clone(),
            metrics.clone(),
        ));
        let timeouts = Arc::new(EvidenceTimeoutProcessor::new(
            storage.clone(),
            tenants.clone(),
            confirmations.clone(),
            evidence.clone(),
            publisher.clone(),
            metrics.clone(),
        ));
        let listener = Arc::new(MessageListener::new(
            storage.clone(),
            evidence.clone(),
            ToGatewayProcessor::new(
                storage.clone(),
                confirmations.clone(),
                recorder.clone(),
                submitter.clone(),
                metrics.clone(),
            ),
            ToBackendProcessor::new(
                storage.clone(),
                routing.clone(),
                confirmations,
                recorder,
                submitter,
                metrics.clone(),
            ),
            publisher,
        ));

        let links = Arc::new(LinkRegistry::new());
        let dispatcher = Arc::new(LinkDispatcher::new(
            links.clone(),
            transports.clone(),
            queues.to_link.clone(),
            max_transport_attempts,
        ));

        Connector {
            cleanup: Arc::new(CleanupHandler::new(storage.clone())),
            storage,
            tenants,
            routing,
            transports,
            evidence,
            timeouts,
            listener,
            dispatcher,
            links,
            queues,
            metrics,
        }
    }

    /// Start one consumer per queue. They stop when `shutdown` turns true.
    pub fn spawn_consumers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(run_consumer(
                self.queues.to_controller.clone(),
                self.listener.clone(),
                self.metrics.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_consumer(
                self.queues.to_link.clone(),
                self.dispatcher.clone(),
                self.metrics.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_consumer(
                self.queues.to_cleanup.clone(),
                self.cleanup.clone(),
                self.metrics.clone(),
                shutdown,
            )),
        ]
    }
}
