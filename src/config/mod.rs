pub mod hot_reload;
pub mod loader;
pub mod tenant;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub use hot_reload::ConfigWatcher;
pub use loader::{load_connector_config, ConfigError, ConfigLoader};
pub use tenant::{ConnectorConfig, EvidenceConfig, RoutingConfig, RoutingRuleDef, TenantConfig};

/// Connector process settings.
#[derive(Debug, Clone, Parser)]
#[command(name = "lanebridge")]
#[command(about = "Store-and-forward message connector between backends and gateways")]
pub struct Settings {
    /// Admin HTTP server listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "LANEBRIDGE_LISTEN_ADDR")]
    pub listen_addr: String,

    /// Path to the tenant configuration YAML file
    #[arg(long, default_value = "lanebridge.yaml", env = "LANEBRIDGE_CONFIG_PATH")]
    pub config_path: PathBuf,

    /// Tenant configuration reload check interval in seconds
    #[arg(long, default_value = "30", env = "LANEBRIDGE_CONFIG_RELOAD_SECS")]
    pub config_reload_secs: u64,

    /// PostgreSQL connection URL (in-memory storage if not set)
    #[arg(long, env = "LANEBRIDGE_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Minimum number of pooled database connections
    #[arg(long, default_value = "1", env = "LANEBRIDGE_DB_MIN_CONNECTIONS")]
    pub db_min_connections: u32,

    /// Maximum number of pooled database connections
    #[arg(long, default_value = "10", env = "LANEBRIDGE_DB_MAX_CONNECTIONS")]
    pub db_max_connections: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false", env = "LANEBRIDGE_LOG_JSON")]
    pub log_json: bool,

    /// Deliveries of a failing message before it is dead-lettered
    #[arg(long, default_value = "5", env = "LANEBRIDGE_MAX_REDELIVERIES")]
    pub max_redeliveries: u32,

    /// Delay before a nacked message is redelivered, in milliseconds
    #[arg(long, default_value = "500", env = "LANEBRIDGE_REDELIVERY_DELAY_MS")]
    pub redelivery_delay_ms: u64,

    /// Transport attempts per message and link before a failure is final
    #[arg(long, default_value = "3", env = "LANEBRIDGE_MAX_TRANSPORT_ATTEMPTS")]
    pub max_transport_attempts: u32,

    /// Evidence timeout check interval in seconds (0 disables the check)
    #[arg(long, default_value = "60", env = "LANEBRIDGE_TIMEOUT_CHECK_SECS")]
    pub timeout_check_secs: u64,

    /// Enable graceful shutdown
    #[arg(long, default_value = "true", env = "LANEBRIDGE_GRACEFUL_SHUTDOWN")]
    pub graceful_shutdown: bool,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "30", env = "LANEBRIDGE_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,
}

impl Settings {
    pub fn config_reload_interval(&self) -> Duration {
        Duration::from_secs(self.config_reload_secs)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    /// `None` when timeout checking is switched off.
    pub fn timeout_check_interval(&self) -> Option<Duration> {
        (self.timeout_check_secs > 0).then(|| Duration::from_secs(self.timeout_check_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: "0.0.0.0:8080".to_string(),
            config_path: PathBuf::from("lanebridge.yaml"),
            config_reload_secs: 30,
            database_url: None,
            db_min_connections: 1,
            db_max_connections: 10,
            log_level: "info".to_string(),
            log_json: false,
            max_redeliveries: 5,
            redelivery_delay_ms: 500,
            max_transport_attempts: 3,
            timeout_check_secs: 60,
            graceful_shutdown: true,
            shutdown_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.listen_addr, "0.0.0.0:8080");
        assert_eq!(settings.max_redeliveries, 5);
        assert_eq!(settings.max_transport_attempts, 3);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn test_parse_from_args() {
        let settings = Settings::parse_from([
            "lanebridge",
            "--config-path",
            "/etc/lanebridge/lanes.yaml",
            "--max-redeliveries",
            "2",
            "--timeout-check-secs",
            "0",
        ]);

        assert_eq!(settings.config_path, PathBuf::from("/etc/lanebridge/lanes.yaml"));
        assert_eq!(settings.max_redeliveries, 2);
        assert!(settings.timeout_check_interval().is_none());
    }

    #[test]
    fn test_duration_helpers() {
        let settings = Settings {
            config_reload_secs: 60,
            redelivery_delay_ms: 250,
            shutdown_timeout_secs: 15,
            ..Default::default()
        };

        assert_eq!(settings.config_reload_interval(), Duration::from_secs(60));
        assert_eq!(settings.redelivery_delay(), Duration::from_millis(250));
        assert_eq!(settings.shutdown_timeout(), Duration::from_secs(15));
        assert_eq!(settings.timeout_check_interval(), Some(Duration::from_secs(60)));
    }
}
