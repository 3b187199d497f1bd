//! RCP Server - edge HTTP layer of the resilient request control plane
//!
//! Every request under `/api/` passes the [`rate_limit::EdgeRateLimiter`]
//! before its handler runs: callers are identified by forwarded address and
//! counted per route in fixed windows, and anything over quota gets a 429
//! with `Retry-After` and `X-RateLimit-*` headers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use server::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::load()?;
//!     server::start_server(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Endpoints
//!
//! - `GET /` - Service information
//! - `GET /health` - Liveness probe
//! - `GET /ready` - Readiness probe
//! - `GET /metrics` - Prometheus metrics
//! - `GET /api/status` - Rate limiter diagnostics
//!
//! Applications mount their own `/api/` routes with [`server::build_router`].

pub mod config;
pub mod error;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod state;

pub use config::{RateLimitConfig, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use rate_limit::{EdgeRateLimiter, Quota, RateDecision, RateWindowCounter, RouteQuotas};
pub use server::{app, build_router, start_server};
pub use state::ServerState;
