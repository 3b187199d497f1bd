//! YAML configuration for the control plane.
//!
//! One file carries every client-side knob. Durations are integer
//! milliseconds; omitted sections fall back to their defaults.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "dashboard"
//!
//! coalescer:
//!   dedup_window: 5000
//!   cache_ttl: 2000
//!   cache_failures: false
//!
//! circuit_breaker:
//!   failure_threshold: 5
//!   open_duration: 30000
//!   probe_timeout: 5000
//!
//! retry:
//!   max_retries: 2
//!   base_delay: 1000
//!   jitter: 1000
//!
//! action_gate:
//!   default_cooldown: 2000
//!
//! http_timeout: 30000
//!
//! realtime:
//!   reconnect_interval: 2000
//!   max_reconnect_attempts: 15
//!   heartbeat_interval: 20000
//!   pong_timeout: null
//! ```

use std::fs;
use std::path::Path;

use realtime::RealtimeConfig;
use resilience::ResilienceConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level YAML configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcpConfig {
    /// Configuration format version
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Coalescer, circuit breaker, retry, action gate and HTTP timeout
    #[serde(flatten)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,
}

impl RcpConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: RcpConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigLoadError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => {}
            v => return Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }
        self.resilience
            .validate()
            .map_err(ConfigLoadError::Validation)?;
        self.realtime.validate().map_err(ConfigLoadError::Validation)
    }
}

impl Default for RcpConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: None,
            resilience: ResilienceConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn load_valid_yaml() {
        let yaml = r#"
version: "1.0"
name: "dashboard"
circuit_breaker:
  failure_threshold: 3
  open_duration: 10000
realtime:
  reconnect_interval: 3000
  max_reconnect_attempts: 10
"#;

        let config = RcpConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name.as_deref(), Some("dashboard"));
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 3);
        assert_eq!(
            config.resilience.circuit_breaker.open_duration,
            Duration::from_secs(10)
        );
        assert_eq!(
            config.resilience.circuit_breaker.probe_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.realtime.reconnect_interval, Duration::from_secs(3));
        assert_eq!(config.realtime.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.resilience.retry.max_retries, 2);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = RcpConfig::from_yaml("{}").unwrap();
        assert_eq!(config, RcpConfig::default());
    }

    #[test]
    fn load_from_file() {
        let yaml = r#"
version: "1"
coalescer:
  cache_ttl: 500
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let config = RcpConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.resilience.coalescer.cache_ttl, Duration::from_millis(500));
        assert_eq!(config.resilience.coalescer.dedup_window, Duration::from_secs(5));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let yaml = r#"
circuit_breaker:
  failure_threshold: 0
"#;
        let err = RcpConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Validation(_)));
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let yaml = r#"
realtime:
  heartbeat_interval: 0
"#;
        assert!(RcpConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = RcpConfig::from_yaml("version: \"2.0\"").unwrap_err();
        assert!(matches!(err, ConfigLoadError::UnsupportedVersion(_)));
    }

    #[test]
    fn yaml_round_trip_preserves_settings() {
        let mut config = RcpConfig::default();
        config.realtime = RealtimeConfig::session().with_pong_timeout(Duration::from_secs(10));
        config.resilience.action_gate.default_cooldown = Duration::from_millis(750);

        let yaml = config.to_yaml().unwrap();
        assert_eq!(RcpConfig::from_yaml(&yaml).unwrap(), config);
    }
}
