//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Collector server settings (bind address, port)
//! - Monitor settings (collector address, default sampling interval)
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration pointing at `127.0.0.1:8080`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::MIN_INTERVAL;

/// Default bind host for the collector server.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default collector port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default sampling interval (1 second).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Collector server configuration.
    pub server: ServerConfig,

    /// Monitor-side configuration.
    pub monitor: MonitorConfig,
}

/// Collector server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host (default: "127.0.0.1").
    pub bind: String,

    /// Listening port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Resolve to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| ConfigError::Validation(format!("invalid bind address: {e}")))
    }
}

/// Monitor-side configuration, for applications embedding the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Collector host to ship snapshots to (default: "127.0.0.1").
    pub collector_host: String,

    /// Collector port (default: 8080).
    pub collector_port: u16,

    /// Default sampling interval (default: "1s").
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collector_host: DEFAULT_BIND.to_string(),
            collector_port: DEFAULT_PORT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl MonitorConfig {
    /// Resolve to the collector's socket address.
    pub fn collector_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.collector_host, self.collector_port)
            .parse()
            .map_err(|e| ConfigError::Validation(format!("invalid collector address: {e}")))
    }
}

impl AppConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate addresses and timings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;
        self.monitor.collector_addr()?;
        if self.monitor.interval < MIN_INTERVAL {
            return Err(ConfigError::Validation(format!(
                "sampling interval {} is below the minimum of {}",
                humantime::format_duration(self.monitor.interval),
                humantime::format_duration(MIN_INTERVAL),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.monitor.interval, Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  bind: "0.0.0.0"
  port: 9100
monitor:
  collector_host: "10.0.0.5"
  collector_port: 9100
  interval: "250ms"
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.monitor.interval, Duration::from_millis(250));
        assert_eq!(
            config.monitor.collector_addr().unwrap().to_string(),
            "10.0.0.5:9100"
        );
    }

    #[test]
    fn test_interval_below_minimum_rejected() {
        let yaml = r#"
monitor:
  interval: "1ms"
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let yaml = r#"
server:
  bind: "not an address"
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 9200").unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.server.bind, "127.0.0.1");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = AppConfig::load("/nonexistent/vitals.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
