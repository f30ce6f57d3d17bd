use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lanebridge::api::{create_router, AppState};
use lanebridge::config::{ConfigLoader, ConfigWatcher, Settings};
use lanebridge::connector::Connector;
use lanebridge::evidence::UnsignedEvidenceToolkit;
use lanebridge::observability::{init_tracing, MetricsRegistry};
use lanebridge::queue::ConnectorQueues;
use lanebridge::storage::{MemoryStore, PostgresStore, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    init_tracing(&settings.log_level, settings.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting lanebridge connector"
    );

    let metrics = Arc::new(MetricsRegistry::new());

    // Tenant configuration, reloaded when its version changes
    let watcher = ConfigWatcher::new(
        ConfigLoader::new(settings.config_path.clone()),
        settings.config_reload_interval(),
    )
    .with_metrics(metrics.clone());
    let (config_rx, config_handle) = watcher.start();
    let initial_config = config_rx.borrow().clone();

    let storage: Arc<dyn Storage> = match settings.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(
                url,
                settings.db_min_connections,
                settings.db_max_connections,
            )
            .await?;
            store.run_migrations().await?;
            info!("Using PostgreSQL storage");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, messages are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let queues = ConnectorQueues::in_memory(settings.max_redeliveries, settings.redelivery_delay());
    let connector = Arc::new(Connector::new(
        initial_config,
        storage,
        Arc::new(UnsignedEvidenceToolkit),
        queues,
        metrics,
        settings.max_transport_attempts,
    ));
    let reload_handle = connector.tenants.clone().spawn_reload_listener(config_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = connector.spawn_consumers(shutdown_rx.clone());

    match settings.timeout_check_interval() {
        Some(interval) => {
            workers.push(tokio::spawn(
                connector.timeouts.clone().run(interval, shutdown_rx),
            ));
        }
        None => info!("Evidence timeout checking disabled"),
    }

    let state = Arc::new(AppState {
        connector: connector.clone(),
        start_time: Instant::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });
    let app = create_router(state);

    let addr: SocketAddr = settings.listen_addr.parse()?;
    info!(addr = %addr, "Starting admin HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if settings.graceful_shutdown {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        axum::serve(listener, app).await?;
    }

    info!("Shutting down...");
    if shutdown_tx.send(true).is_err() {
        warn!("All workers already stopped");
    }

    let drained = tokio::time::timeout(settings.shutdown_timeout(), async {
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            timeout_secs = settings.shutdown_timeout().as_secs(),
            "Workers did not stop in time"
        );
    }

    reload_handle.abort();
    config_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
