use crate::config::ServerConfig;
use crate::rate_limit::EdgeRateLimiter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use resilience::SharedClock;
use std::sync::Arc;

/// Process-wide Prometheus recorder; `metrics` allows only one global recorder.
static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once and hand out its render handle.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PROMETHEUS.get_or_try_init(|| PrometheusBuilder::new().install_recorder())?;
    Ok(handle.clone())
}

/// Shared application state
#[derive(Clone)]
pub struct ServerState {
    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// Per (identity, route) request windows
    pub limiter: Arc<EdgeRateLimiter>,

    /// Renders `/metrics`; `None` when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
}

impl ServerState {
    /// Create new server state
    pub fn new(config: ServerConfig) -> Self {
        let limiter = EdgeRateLimiter::new(config.rate_limit.quotas.clone());
        Self::from_parts(config, limiter)
    }

    /// State whose rate windows read time from `clock`.
    pub fn with_clock(config: ServerConfig, clock: SharedClock) -> Self {
        let limiter = EdgeRateLimiter::with_clock(config.rate_limit.quotas.clone(), clock);
        Self::from_parts(config, limiter)
    }

    fn from_parts(config: ServerConfig, limiter: EdgeRateLimiter) -> Self {
        Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Server metadata for health checks
#[derive(Debug, serde::Serialize)]
pub struct ServerMetadata {
    pub version: String,
    pub uptime_seconds: u64,
}
