use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::observability::MetricsRegistry;

use super::loader::{ConfigError, ConfigLoader};
use super::tenant::ConnectorConfig;

/// Polls the configuration file and publishes new versions.
pub struct ConfigWatcher {
    loader: ConfigLoader,
    check_interval: Duration,
    last_version: Option<String>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ConfigWatcher {
    pub fn new(loader: ConfigLoader, check_interval: Duration) -> Self {
        ConfigWatcher {
            loader,
            check_interval,
            last_version: None,
            metrics: None,
        }
    }

    /// Count reloads and failed reload attempts in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load the initial configuration and start polling.
    ///
    /// The receiver sees a new value whenever the `version` of the file
    /// changes and the file still validates. An invalid file keeps the
    /// previous configuration in place.
    pub fn start(
        mut self,
    ) -> (
        watch::Receiver<Arc<ConnectorConfig>>,
        tokio::task::JoinHandle<()>,
    ) {
        let initial = match self.loader.load() {
            Ok(config) => {
                self.last_version = Some(config.version.clone());
                info!(
                    version = %config.version,
                    tenants = config.tenants.len(),
                    "Loaded connector configuration"
                );
                Arc::new(config)
            }
            Err(e) => {
                error!(path = %self.loader.path().display(), error = %e, "Failed to load connector configuration");
                Arc::new(ConnectorConfig::empty())
            }
        };

        let (tx, rx) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            let mut interval = interval(self.check_interval);

            loop {
                interval.tick().await;

                match self.check_for_updates(&tx) {
                    Ok(true) => {
                        info!("Connector configuration reloaded");
                        self.record_reload(true);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "Error checking for configuration updates");
                        self.record_reload(false);
                    }
                }
            }
        });

        (rx, handle)
    }

    fn check_for_updates(
        &mut self,
        tx: &watch::Sender<Arc<ConnectorConfig>>,
    ) -> Result<bool, ConfigError> {
        let config = self.loader.load()?;

        if self.last_version.as_ref() == Some(&config.version) {
            return Ok(false);
        }

        info!(
            "Configuration version changed: {:?} -> {}",
            self.last_version, config.version
        );

        self.last_version = Some(config.version.clone());
        let _ = tx.send(Arc::new(config));

        Ok(true)
    }

    fn record_reload(&self, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_config_reload(success);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const V1: &str = r#"
version: "v1"
tenants:
  - id: lane1
    routing:
      default_backend_name: backend-a
      default_gateway_name: gw
"#;

    #[tokio::test]
    async fn test_watcher_initial_load() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", V1).unwrap();

        let watcher = ConfigWatcher::new(ConfigLoader::new(file.path()), Duration::from_secs(60));
        let (rx, handle) = watcher.start();

        assert_eq!(rx.borrow().version, "v1");
        assert_eq!(rx.borrow().tenants.len(), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_watcher_missing_file_starts_empty() {
        let watcher = ConfigWatcher::new(
            ConfigLoader::new("/nonexistent/lanebridge.yaml"),
            Duration::from_secs(60),
        );
        let (rx, handle) = watcher.start();

        assert!(rx.borrow().tenants.is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn test_watcher_detects_changes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", V1).unwrap();
        let path = file.path().to_path_buf();

        let metrics = Arc::new(MetricsRegistry::new());
        let watcher = ConfigWatcher::new(ConfigLoader::new(&path), Duration::from_millis(50))
            .with_metrics(metrics.clone());
        let (mut rx, handle) = watcher.start();

        assert_eq!(rx.borrow().version, "v1");

        tokio::time::sleep(Duration::from_millis(10)).await;
        std::fs::write(
            &path,
            r#"
version: "v2"
tenants:
  - id: lane1
    routing:
      default_backend_name: backend-b
      default_gateway_name: gw
  - id: lane2
    routing:
      default_backend_name: backend-c
      default_gateway_name: gw
"#,
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("Timeout waiting for configuration change")
            .unwrap();

        assert_eq!(rx.borrow().version, "v2");
        assert_eq!(rx.borrow().tenants.len(), 2);
        assert_eq!(
            metrics
                .config_reloads_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        handle.abort();
    }
}
