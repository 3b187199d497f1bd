use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::rate_limit::RouteQuotas;

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Log filter directive, e.g. `info` or `server=debug,tower_http=info`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metrics endpoint enabled
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Edge rate limiting for `/api/` routes
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Edge rate limiter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often expired windows are purged, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub quotas: RouteQuotas,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval_secs(),
            quotas: RouteQuotas::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            enable_cors: default_true(),
            log_level: default_log_level(),
            metrics_enabled: default_true(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional `server.{toml,yaml,json}` file and
    /// `RCP_SERVER__*` environment variables, after reading `.env` if present.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }

        let builder = config::Config::builder()
            .add_source(config::File::with_name("server").required(false))
            .add_source(config::Environment::with_prefix("RCP_SERVER").separator("__"));

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be positive");
        }
        if self.rate_limit.sweep_interval_secs == 0 {
            anyhow::bail!("rate_limit.sweep_interval_secs must be positive");
        }
        let quotas = &self.rate_limit.quotas;
        for (path, quota) in std::iter::once(("default", &quotas.default))
            .chain(quotas.routes.iter().map(|(p, q)| (p.as_str(), q)))
        {
            if quota.max_requests == 0 || quota.window_ms == 0 {
                anyhow::bail!("rate limit quota for {path} must have a positive limit and window");
            }
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.bind_addr, self.port);
        Ok(addr_str.parse()?)
    }

    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::Quota;

    #[test]
    fn default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.timeout_secs, 30);
        assert!(cfg.enable_cors);
        assert!(cfg.metrics_enabled);
        assert!(cfg.rate_limit.enabled);
        assert_eq!(cfg.rate_limit.sweep_interval(), Duration::from_secs(300));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn socket_addr() {
        let cfg = ServerConfig::default();
        let addr = cfg.socket_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn quota_table_deserializes_from_json() {
        let cfg: ServerConfig = serde_json::from_str(
            r#"{
                "port": 9000,
                "rate_limit": {
                    "quotas": {
                        "default": {"max_requests": 50, "window_ms": 30000},
                        "routes": {"/api/claim-rewards": {"max_requests": 3, "window_ms": 60000}}
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(cfg.rate_limit.enabled);
        assert_eq!(cfg.rate_limit.quotas.default.max_requests, 50);
        assert_eq!(
            cfg.rate_limit.quotas.for_path("/api/claim-rewards"),
            Quota {
                max_requests: 3,
                window_ms: 60_000
            }
        );
        assert_eq!(cfg.rate_limit.quotas.for_path("/api/referrals").max_requests, 50);
    }

    #[test]
    fn zero_quota_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.rate_limit.quotas.default.max_requests = 0;
        assert!(cfg.validate().is_err());
    }
}
