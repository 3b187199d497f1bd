//! Workspace umbrella crate for the Resilient Request Control Plane (RCP).
//!
//! This crate stitches the client-side protections together so callers can
//! configure them from one YAML file and reach them through a single
//! [`ControlPlane`] handle:
//!
//! - [`resilience`]: request coalescing, circuit breaking, backoff retry and
//!   the action gate, composed by [`ResilientClient`].
//! - [`realtime`]: the self-healing realtime channel.
//!
//! The edge rate limiter lives in the `rcp-server` crate.

pub mod config;

pub use config::{ConfigLoadError, RcpConfig};
pub use realtime::{
    Connection, ConnectionPhase, Connector, Envelope, FrameSink, FrameStream, RealtimeConfig,
    RealtimeError, RealtimeManager, SubscriptionId, PING_TAG,
};
#[cfg(feature = "websocket")]
pub use realtime::WebSocketConnector;
pub use resilience::{
    default_clock, execute_with_retry, retry, ActionGate, ActionGateConfig, Admission, CallError,
    CallOptions, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitSnapshot,
    CircuitState, Clock, CoalescerConfig, CoalescerStats, EndpointStats, ExecuteOptions,
    FailureKind, HttpRequest, HttpResponse, HttpTransport, ManualClock, RequestCoalescer,
    ResilienceConfig, ResilientClient, RetryConfig, RetryResult, SharedClock, TokioClock,
    UserFacing,
};
#[cfg(feature = "reqwest")]
pub use resilience::ReqwestTransport;

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// Monitoring view of every client-side table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlPlaneStatus {
    pub name: Option<String>,
    pub circuits: Vec<CircuitSnapshot>,
    pub coalescer: CoalescerStats,
}

/// One configured set of protections shared by an application.
///
/// Cloning is cheap; clones share the coalescer, circuits and cooldowns.
#[derive(Clone)]
pub struct ControlPlane {
    config: Arc<RcpConfig>,
    client: ResilientClient,
    gate: Arc<ActionGate>,
}

impl ControlPlane {
    pub fn new(transport: Arc<dyn HttpTransport>, config: RcpConfig) -> Self {
        Self::with_clock(transport, config, default_clock())
    }

    pub fn with_clock(
        transport: Arc<dyn HttpTransport>,
        config: RcpConfig,
        clock: SharedClock,
    ) -> Self {
        let client = ResilientClient::with_clock(transport, &config.resilience, Arc::clone(&clock));
        let gate = ActionGate::with_clock(config.resilience.action_gate, clock);
        tracing::debug!(
            name = config.name.as_deref().unwrap_or("default"),
            failure_threshold = config.resilience.circuit_breaker.failure_threshold,
            cache_ttl_ms = config.resilience.coalescer.cache_ttl.as_millis() as u64,
            "control plane initialised"
        );
        Self {
            config: Arc::new(config),
            client,
            gate: Arc::new(gate),
        }
    }

    /// Build a control plane over the reqwest transport.
    #[cfg(feature = "reqwest")]
    pub fn from_config(config: RcpConfig) -> Result<Self, CallError> {
        let transport = ReqwestTransport::new(config.resilience.http_timeout)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn config(&self) -> &RcpConfig {
        &self.config
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    pub fn gate(&self) -> &ActionGate {
        &self.gate
    }

    /// Issue `request` through retry, coalescing and circuit breaking.
    pub async fn call(
        &self,
        request: HttpRequest,
        options: CallOptions,
    ) -> Result<HttpResponse, CallError> {
        self.client.call(request, options).await
    }

    /// Call with the retry budget from the configuration.
    pub async fn get(&self, url: impl Into<String>) -> Result<HttpResponse, CallError> {
        self.client
            .call(HttpRequest::get(url), self.client.default_options())
            .await
    }

    /// Run `action` unless `key` fired within the default cooldown.
    ///
    /// Returns `None` when the action was suppressed.
    pub async fn gated<T, F, Fut>(&self, key: &str, action: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.gate.try_fire_default(key) {
            return None;
        }
        Some(action().await)
    }

    /// A realtime channel using the configured reconnect and heartbeat settings.
    pub fn realtime_channel(&self, connector: Arc<dyn Connector>) -> RealtimeManager {
        RealtimeManager::new(self.config.realtime, connector)
    }

    #[cfg(feature = "websocket")]
    pub fn websocket_channel(&self) -> RealtimeManager {
        RealtimeManager::websocket(self.config.realtime)
    }

    pub fn status(&self) -> ControlPlaneStatus {
        ControlPlaneStatus {
            name: self.config.name.clone(),
            circuits: self.client.circuit_status(),
            coalescer: self.client.coalescer_stats(),
        }
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
