//! Server initialization and routing
//!
//! Middleware stack, outermost first:
//! 1. Request ID tracking
//! 2. Request logging
//! 3. Tracing, CORS, compression and timeout
//! 4. Edge rate limiting (`/api/` paths only)

use crate::config::ServerConfig;
use crate::middleware::{log_requests, rate_limit, request_id};
use crate::rate_limit::EdgeRateLimiter;
use crate::routes::{api_info, health, not_found};
use crate::state::{install_prometheus, ServerState};
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Router with only the built-in endpoints.
pub fn app(state: Arc<ServerState>) -> Router {
    build_router(state, Router::new())
}

/// Build the router around application routes in `api`.
///
/// `api` is merged next to the built-in endpoints; every path it serves
/// under `/api/` is rate limited before its handler runs.
pub fn build_router(state: Arc<ServerState>, api: Router<Arc<ServerState>>) -> Router {
    let cors = if state.config.enable_cors {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    let builtin = Router::new()
        .route("/", get(api_info))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics))
        .route("/api/status", get(health::rate_limit_status));

    Router::new()
        .merge(builtin)
        .merge(api)
        .fallback(not_found)
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.timeout(),
        ))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(log_requests))
        .layer(from_fn(request_id))
        .with_state(state)
}

/// Purge expired rate windows every `every`.
pub fn spawn_window_sweeper(limiter: Arc<EdgeRateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = limiter.sweep();
            if purged > 0 {
                tracing::debug!(purged, remaining = limiter.tracked(), "swept expired rate windows");
            }
        }
    })
}

/// Start the RCP edge server
///
/// Blocks until SIGTERM or Ctrl+C, then drains in-flight requests.
///
/// # Initialization
///
/// 1. Sets up structured JSON logging with the configured filter
/// 2. Installs the Prometheus recorder when metrics are enabled
/// 3. Creates shared state and starts the rate window sweeper
/// 4. Binds the TCP listener and serves with peer addresses attached
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json()
        .init();

    let mut state = ServerState::new(config.clone());
    if config.metrics_enabled {
        state = state.with_metrics(install_prometheus()?);
    }
    let state = Arc::new(state);

    let sweeper = spawn_window_sweeper(
        Arc::clone(&state.limiter),
        config.rate_limit.sweep_interval(),
    );
    let app = app(state);

    let addr: SocketAddr = config.socket_addr()?;
    tracing::info!(
        addr = %addr,
        timeout_secs = config.timeout_secs,
        rate_limit = config.rate_limit.enabled,
        routes = config.rate_limit.quotas.routes.len(),
        default_limit = config.rate_limit.quotas.default.max_requests,
        cors = config.enable_cors,
        metrics = config.metrics_enabled,
        "Starting RCP edge server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
