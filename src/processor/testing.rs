//! Service graph over a memory store, shared by the processor tests.

use std::sync::Arc;

use crate::config::ConnectorConfig;
use crate::domain::{BusinessDomainId, LinkPartnerName};
use crate::evidence::{
    ConfirmationCreator, ConfirmationRecorder, EvidenceProcessor, EvidenceToolkit,
    UnsignedEvidenceToolkit,
};
use crate::observability::MetricsRegistry;
use crate::routing::RoutingRuleRegistry;
use crate::storage::{MemoryStore, Storage};
use crate::tenant::TenantRegistry;
use crate::transport::TransportStateService;

use super::submit::LinkSubmitter;

pub(crate) struct Services {
    pub store: Arc<MemoryStore>,
    pub storage: Arc<dyn Storage>,
    pub routing: Arc<RoutingRuleRegistry>,
    pub transports: Arc<TransportStateService>,
    pub confirmations: Arc<ConfirmationCreator>,
    pub recorder: Arc<ConfirmationRecorder>,
    pub submitter: Arc<LinkSubmitter>,
    pub evidence: Arc<EvidenceProcessor>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Lane `lane1` with backend `backend-a` and gateway `gw`.
pub(crate) fn services(toolkit: Option<Arc<dyn EvidenceToolkit>>) -> Services {
    let config = ConnectorConfig::single_tenant(
        BusinessDomainId::default_lane(),
        LinkPartnerName::new("backend-a"),
        LinkPartnerName::new("gw"),
    );
    let toolkit = toolkit.unwrap_or_else(|| Arc::new(UnsignedEvidenceToolkit));

    let store = Arc::new(MemoryStore::new());
    let storage: Arc<dyn Storage> = store.clone();
    let metrics = Arc::new(MetricsRegistry::new());
    let tenants = Arc::new(TenantRegistry::new(Arc::new(config)));
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
    let evidence = Arc::new(EvidenceProcessor::new(
        storage.clone(),
        tenants,
        confirmations.clone(),
        recorder.clone(),
        submitter.clone(),
        metrics.clone(),
    ));

    Services {
        store,
        storage,
        routing,
        transports,
        confirmations,
        recorder,
        submitter,
        evidence,
        metrics,
    }
}
