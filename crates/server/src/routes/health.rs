use crate::error::{ServerError, ServerResult};
use crate::state::{ServerMetadata, ServerState};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use std::time::SystemTime;

/// Global server start time for uptime calculation
static SERVER_START_TIME: once_cell::sync::Lazy<SystemTime> =
    once_cell::sync::Lazy::new(SystemTime::now);

fn uptime_seconds() -> u64 {
    SERVER_START_TIME
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Health check endpoint (liveness)
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "rcp-server",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds(),
    }))
}

/// Readiness check endpoint
pub async fn readiness_check(
    State(state): State<Arc<ServerState>>,
) -> ServerResult<impl IntoResponse> {
    let metrics = match (&state.metrics, state.config.metrics_enabled) {
        (Some(_), _) => "ready",
        (None, true) => "unavailable",
        (None, false) => "disabled",
    };

    Ok(Json(json!({
        "status": "ready",
        "service": "rcp-server",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds(),
        "components": {
            "api": "ready",
            "rate_limiter": if state.config.rate_limit.enabled { "ready" } else { "disabled" },
            "metrics": metrics,
        }
    })))
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<Arc<ServerState>>) -> ServerResult<impl IntoResponse> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ServerError::Unavailable("metrics recorder not installed".into()))?;
    metrics::gauge!("rcp_rate_limit_tracked_windows").set(state.limiter.tracked() as f64);
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], handle.render()))
}

/// Limiter diagnostics. Served under `/api/` so it is rate limited itself.
pub async fn rate_limit_status(
    State(state): State<Arc<ServerState>>,
) -> ServerResult<impl IntoResponse> {
    let metadata = ServerMetadata {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime_seconds(),
    };

    Ok(Json(json!({
        "server": serde_json::to_value(metadata)?,
        "rate_limit": {
            "enabled": state.config.rate_limit.enabled,
            "tracked_windows": state.limiter.tracked(),
            "sweep_interval_secs": state.config.rate_limit.sweep_interval_secs,
            "quotas": state.limiter.quotas(),
        }
    })))
}
