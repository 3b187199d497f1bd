//! Resilient request control plane: client-side protections for calls to a
//! slow, flaky or throttling upstream.
//!
//! - [`RequestCoalescer`] merges concurrent identical requests and memoizes
//!   their outcome for a short TTL.
//! - [`CircuitBreaker`] isolates endpoints that keep failing and lets a single
//!   probe through once the cooldown elapses.
//! - [`execute_with_retry`] re-issues failed operations with exponential,
//!   jittered backoff.
//! - [`ActionGate`] suppresses rapid re-invocation of user-triggered actions.
//! - [`ResilientClient`] stacks the first three around an [`HttpTransport`].
//!
//! Every table is an explicit object with an injectable [`Clock`]; nothing
//! here is a process-wide singleton.
//!
//! ## Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use resilience::{CallOptions, HttpRequest, ReqwestTransport, ResilienceConfig, ResilientClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), resilience::CallError> {
//!     let config = ResilienceConfig::default();
//!     let transport = Arc::new(ReqwestTransport::new(config.http_timeout)?);
//!     let client = ResilientClient::new(transport, &config);
//!
//!     let resp = client
//!         .call(HttpRequest::get("https://example.com/api/earnings"), CallOptions::default())
//!         .await?;
//!     println!("{}", resp.status);
//!     Ok(())
//! }
//! ```

pub mod action_gate;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod retry;
pub mod transport;

mod serde_millis;

pub use action_gate::{ActionGate, ActionGateConfig};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitSnapshot,
    CircuitState, EndpointStats,
};
pub use client::{CallOptions, ResilientClient};
pub use clock::{default_clock, Clock, ManualClock, SharedClock, TokioClock};
pub use coalesce::{CoalescerConfig, CoalescerStats, ExecuteOptions, RequestCoalescer};
pub use config::ResilienceConfig;
pub use error::{CallError, FailureKind, UserFacing};
pub use retry::{execute_with_retry, retry, RetryConfig, RetryResult};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
pub use transport::{HttpRequest, HttpResponse, HttpTransport};
