//! Circuit breaker pattern for upstream endpoints.
//!
//! The circuit breaker prevents cascading failures by stopping requests to a failing endpoint
//! after a threshold of consecutive failures is reached. Once the open period elapses a single
//! probe is let through (half-open) to check whether the endpoint has recovered.

use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::{default_clock, SharedClock};
use crate::error::CallError;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    #[serde(with = "crate::serde_millis")]
    pub open_duration: Duration,
    /// How long a half-open probe may stay in flight before another probe is admitted.
    #[serde(with = "crate::serde_millis")]
    pub probe_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with custom failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Create a new config with custom open duration.
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, one probe request is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-endpoint call statistics. Informational only; they never drive transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStats {
    pub endpoint: String,
    pub call_count: u64,
    pub failure_count: u64,
    /// Running mean over successful calls.
    pub avg_latency: Duration,
    pub last_called: Option<Instant>,
}

/// Point-in-time view of one breaker, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds until a probe is allowed, while open.
    pub next_probe_in_ms: Option<u64>,
}

/// Ticket handed out by [`CircuitBreaker::allow_request`].
///
/// Results are recorded against the ticket of the request that produced them,
/// so only the admitted probe can settle a half-open circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Admission {
    probe: Option<u64>,
}

impl Admission {
    /// Whether this request was admitted as the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    probe_started_at: Option<Instant>,
    probe: Option<u64>,
    probes_admitted: u64,
    call_count: u64,
    failed_calls: u64,
    avg_latency: Duration,
    last_called: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_probe_at: None,
            probe_started_at: None,
            probe: None,
            probes_admitted: 0,
            call_count: 0,
            failed_calls: 0,
            avg_latency: Duration::ZERO,
            last_called: None,
        }
    }

    fn close(&mut self) {
        self.phase = CircuitState::Closed;
        self.failure_count = 0;
        self.next_probe_at = None;
        self.probe_started_at = None;
        self.probe = None;
    }

    fn open(&mut self, now: Instant, open_duration: Duration) {
        self.phase = CircuitState::Open;
        self.next_probe_at = Some(now + open_duration);
        self.probe_started_at = None;
        self.probe = None;
    }

    fn admit_probe(&mut self, now: Instant) -> Admission {
        self.probes_admitted += 1;
        self.probe = Some(self.probes_admitted);
        self.probe_started_at = Some(now);
        Admission { probe: self.probe }
    }

    fn is_current_probe(&self, admission: Admission) -> bool {
        admission.probe.is_some() && admission.probe == self.probe
    }
}

/// Circuit breaker for one endpoint identity.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(endpoint, config, default_clock())
    }

    pub fn with_clock(
        endpoint: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            clock,
            state: Mutex::new(BreakerState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check if a request should be allowed through.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and admits
    /// the caller as the probe. While the probe is in flight everybody else is
    /// rejected.
    pub fn allow_request(&self) -> Result<Admission, CallError> {
        let now = self.clock.now();
        let mut state = self.lock();

        match state.phase {
            CircuitState::Closed => Ok(Admission { probe: None }),
            CircuitState::Open => {
                let next_probe_at = state.next_probe_at.unwrap_or(now);
                if now >= next_probe_at {
                    state.phase = CircuitState::HalfOpen;
                    tracing::info!(endpoint = %self.endpoint, "circuit half-open, admitting probe");
                    Ok(state.admit_probe(now))
                } else {
                    Err(CallError::circuit_open(
                        &self.endpoint,
                        next_probe_at.duration_since(now),
                    ))
                }
            }
            CircuitState::HalfOpen => match state.probe_started_at {
                Some(started) if now.duration_since(started) < self.config.probe_timeout => {
                    Err(CallError::circuit_open(
                        &self.endpoint,
                        self.config.probe_timeout - now.duration_since(started),
                    ))
                }
                _ => {
                    tracing::debug!(endpoint = %self.endpoint, "half-open probe timed out, admitting another");
                    Ok(state.admit_probe(now))
                }
            },
        }
    }

    /// Record a successful request.
    pub fn record_success(&self, admission: Admission, latency: Duration) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.call_count += 1;
        state.last_called = Some(now);
        let successes = (state.call_count - state.failed_calls) as u32;
        if successes > 0 {
            let avg = state.avg_latency;
            state.avg_latency = if latency >= avg {
                avg + (latency - avg) / successes
            } else {
                avg - (avg - latency) / successes
            };
        }

        match state.phase {
            CircuitState::HalfOpen if state.is_current_probe(admission) => {
                tracing::info!(endpoint = %self.endpoint, "probe succeeded, circuit closed");
                state.close();
            }
            CircuitState::HalfOpen => {
                tracing::debug!(endpoint = %self.endpoint, "success from a non-probe request, circuit stays half-open");
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.call_count += 1;
        state.failed_calls += 1;
        state.last_called = Some(now);

        match state.phase {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.last_failure_at = Some(now);
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        failures = state.failure_count,
                        "circuit opened after consecutive failures"
                    );
                    state.open(now, self.config.open_duration);
                    self.count_trip();
                }
            }
            CircuitState::HalfOpen if state.is_current_probe(admission) => {
                state.failure_count += 1;
                state.last_failure_at = Some(now);
                tracing::warn!(endpoint = %self.endpoint, "probe failed, circuit re-opened");
                state.open(now, self.config.open_duration);
                self.count_trip();
            }
            // Late result of a request admitted before the circuit opened.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn count_trip(&self) {
        metrics::counter!("rcp_circuit_trips_total", "endpoint" => self.endpoint.clone())
            .increment(1);
    }

    /// Feed a settled call into the breaker.
    ///
    /// Failures that prove the endpoint answered (4xx) count as a call failure
    /// in the stats but as a success for the state machine.
    pub fn record_outcome<T>(
        &self,
        admission: Admission,
        outcome: &Result<T, CallError>,
        latency: Duration,
    ) {
        match outcome {
            Ok(_) => self.record_success(admission, latency),
            Err(err) if err.trips_circuit() => self.record_failure(admission),
            Err(_) => {
                self.lock().failed_calls += 1;
                self.record_success(admission, latency);
            }
        }
    }

    /// Run `operation` through the breaker.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let admission = self.allow_request()?;
        let start = self.clock.now();
        let outcome = operation().await;
        let latency = self.clock.now().saturating_duration_since(start);
        self.record_outcome(admission, &outcome, latency);
        outcome
    }

    /// Get the current state.
    pub fn current_state(&self) -> CircuitState {
        self.lock().phase
    }

    /// Consecutive failures counted by the state machine.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.lock().last_failure_at
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let state = self.lock();
        CircuitSnapshot {
            endpoint: self.endpoint.clone(),
            state: state.phase,
            failure_count: state.failure_count,
            next_probe_in_ms: match state.phase {
                CircuitState::Open => state
                    .next_probe_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }

    pub fn stats(&self) -> EndpointStats {
        let state = self.lock();
        EndpointStats {
            endpoint: self.endpoint.clone(),
            call_count: state.call_count,
            failure_count: state.failed_calls,
            avg_latency: state.avg_latency,
            last_called: state.last_called,
        }
    }
}

/// Manager for multiple circuit breakers (one per endpoint).
#[derive(Debug)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    clock: SharedClock,
}

impl CircuitBreakerManager {
    /// Create a new manager with default config.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, default_clock())
    }

    pub fn with_clock(default_config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            clock,
        }
    }

    /// Get or create a circuit breaker for an endpoint.
    pub fn get_or_create(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    endpoint,
                    self.default_config,
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    /// Snapshot every known breaker.
    pub fn status(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    pub fn stats(&self) -> Vec<EndpointStats> {
        let mut all: Vec<_> = self.breakers.iter().map(|entry| entry.value().stats()).collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    /// Reset all circuit breakers.
    pub fn reset_all(&self) {
        self.breakers.clear();
    }

    /// Check if an endpoint is healthy (circuit closed).
    pub fn is_healthy(&self, endpoint: &str) -> bool {
        self.breakers
            .get(endpoint)
            .map(|cb| cb.current_state() == CircuitState::Closed)
            .unwrap_or(true)
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
