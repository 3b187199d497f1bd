//! Integration tests for the edge rate limiter and built-in endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use resilience::ManualClock;
use serde_json::{json, Value};
use server::{build_router, Quota, ServerConfig, ServerState};
use tower::ServiceExt;

fn state_with_clock() -> (Arc<ServerState>, ManualClock) {
    let clock = ManualClock::new();
    let state = ServerState::with_clock(ServerConfig::default(), Arc::new(clock.clone()));
    (Arc::new(state), clock)
}

fn app(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route(
            "/api/claim-rewards",
            post(|| async { Json(json!({"claimed": true})) }),
        )
        .route(
            "/api/earnings",
            get(|| async { Json(json!({"totalEarnings": 1234})) }),
        );
    build_router(state, api)
}

fn request(method: &str, uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header("user-agent", "integration-test")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn allowed_requests_carry_quota_headers() {
    let (state, _) = state_with_clock();
    let app = app(state);

    let response = app
        .oneshot(request("GET", "/api/earnings", "203.0.113.1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "30");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "29");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(json_body(response).await, json!({"totalEarnings": 1234}));
}

#[tokio::test]
async fn sixth_claim_in_a_minute_is_rejected() {
    let (state, clock) = state_with_clock();
    let app = app(state);

    for n in 1..=5 {
        let response = app
            .clone()
            .oneshot(request("POST", "/api/claim-rewards", "203.0.113.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "claim {n}");
    }

    clock.advance(Duration::from_millis(10_500));
    let response = app
        .clone()
        .oneshot(request("POST", "/api/claim-rewards", "203.0.113.9"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    assert_eq!(headers["retry-after"], "50");
    assert_eq!(headers["x-ratelimit-limit"], "5");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    let reset: i64 = headers["x-ratelimit-reset"].to_str().unwrap().parse().unwrap();
    assert!(reset > chrono::Utc::now().timestamp_millis());

    let body = json_body(response).await;
    assert_eq!(body["error"], "Rate limit exceeded. Too many requests.");
    assert_eq!(body["retryAfter"], 50);

    // Another caller is unaffected.
    let response = app
        .oneshot(request("POST", "/api/claim-rewards", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn quota_returns_after_the_window_rolls_over() {
    let (state, clock) = state_with_clock();
    let app = app(state);

    for _ in 0..6 {
        let _ = app
            .clone()
            .oneshot(request("POST", "/api/claim-rewards", "10.1.1.1"))
            .await
            .unwrap();
    }
    clock.advance(Duration::from_secs(60));

    let response = app
        .oneshot(request("POST", "/api/claim-rewards", "10.1.1.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
}

#[tokio::test]
async fn non_api_paths_are_not_limited() {
    let mut config = ServerConfig::default();
    config.rate_limit.quotas.default = Quota {
        max_requests: 1,
        window_ms: 60_000,
    };
    let state = Arc::new(ServerState::new(config));
    let app = app(state.clone());

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(request("GET", "/health", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }
    assert_eq!(state.limiter.tracked(), 0);
}

#[tokio::test]
async fn disabled_limiter_lets_everything_through() {
    let mut config = ServerConfig::default();
    config.rate_limit.enabled = false;
    let app = app(Arc::new(ServerState::new(config)));

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(request("POST", "/api/claim-rewards", "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn status_endpoint_reports_limiter_state() {
    let (state, _) = state_with_clock();
    let app = app(state);

    let _ = app
        .clone()
        .oneshot(request("GET", "/api/earnings", "10.0.0.3"))
        .await
        .unwrap();
    let response = app
        .oneshot(request("GET", "/api/status", "10.0.0.3"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["rate_limit"]["enabled"], true);
    assert_eq!(body["rate_limit"]["tracked_windows"], 2);
    assert_eq!(
        body["rate_limit"]["quotas"]["routes"]["/api/claim-rewards"]["max_requests"],
        5
    );
}

#[tokio::test]
async fn unknown_routes_get_the_error_envelope() {
    let (state, _) = state_with_clock();
    let response = app(state)
        .oneshot(request("GET", "/nope", "10.0.0.4"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn metrics_without_recorder_is_unavailable() {
    let (state, _) = state_with_clock();
    let response = app(state)
        .oneshot(request("GET", "/metrics", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
