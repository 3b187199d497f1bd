use crate::error::ServerError;
use crate::rate_limit::RateDecision;
use crate::state::ServerState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Best-effort caller identity: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Edge rate limiting for `/api/` routes.
///
/// Runs before the route handler. Rejected requests never reach it.
pub async fn rate_limit(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if !state.config.rate_limit.enabled || !path.starts_with("/api/") {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = client_identity(request.headers(), peer);
    let decision = state.limiter.check(&identity, &path);
    let route = state.limiter.quotas().route_label(&path).to_owned();

    if !decision.allowed {
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        tracing::warn!(
            identity = %identity,
            path = %path,
            attempts = decision.count,
            limit = decision.limit,
            user_agent = %user_agent,
            "rate limit exceeded"
        );
        metrics::counter!("rcp_rate_limit_rejected_total", "route" => route).increment(1);

        let mut response = ServerError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        }
        .into_response();
        apply_rate_headers(response.headers_mut(), &decision, true);
        return response;
    }

    metrics::counter!("rcp_rate_limit_allowed_total", "route" => route).increment(1);
    let mut response = next.run(request).await;
    apply_rate_headers(response.headers_mut(), &decision, false);
    response
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision, rejected: bool) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    if rejected {
        let reset_at =
            chrono::Utc::now().timestamp_millis() + decision.reset_after.as_millis() as i64;
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
    }
}

/// Request ID injection middleware
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Request identifier stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Logging middleware
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    tracing::info!(
        method = %method,
        uri = %uri,
        request_id = %request_id,
        "Request started"
    );

    let response = next.run(request).await;
    let duration = start.elapsed();
    let status = response.status();

    metrics::histogram!("rcp_http_request_duration_seconds", "status" => status.as_u16().to_string())
        .record(duration.as_secs_f64());
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = %duration.as_millis(),
        request_id = %request_id,
        "Request completed"
    );

    response
}
