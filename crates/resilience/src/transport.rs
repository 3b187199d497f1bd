//! The "issue an HTTP call, get a response or a failure" seam.
//!
//! [`HttpTransport`] is the only thing the resilience layer knows about the
//! network. Production code uses [`ReqwestTransport`]; tests plug in fakes.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::CallError;

/// An outgoing HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self::new("POST", url).with_body(Bytes::from(body.to_string()))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Identity used for coalescing: method, target and a SHA-256 digest of the body.
    pub fn coalescing_key(&self) -> String {
        let body = self
            .body
            .as_ref()
            .map(|b| hex::encode(Sha256::digest(b)))
            .unwrap_or_default();
        format!("{}:{}:{}", self.method, self.url, body)
    }

    /// Identity used for circuit breaking: the URL path.
    pub fn endpoint(&self) -> String {
        endpoint_path(&self.url)
    }
}

/// Extract the path component of `url`, without query or fragment.
pub fn endpoint_path(url: &str) -> String {
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => url,
    };
    let path = path.split(['?', '#']).next().unwrap_or(path);
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// A settled HTTP answer. Cheap to clone, so one answer can be handed to
/// every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string()).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            CallError::new(
                crate::error::FailureKind::PermanentClient,
                format!("response body is not valid JSON: {err}"),
            )
        })
    }

    /// Turn a non-2xx answer into a classified failure.
    pub fn error_for_status(self) -> Result<Self, CallError> {
        if self.is_success() {
            return Ok(self);
        }
        let retry_after = self
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = String::from_utf8_lossy(&self.body);
        let reason: String = body.chars().take(200).collect();
        Err(CallError::from_status(self.status, reason, retry_after))
    }
}

/// Issues one HTTP call. Non-2xx answers are returned as `Ok`; only failures
/// to get an answer at all are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CallError>;
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::*;
    use reqwest::header::CONTENT_TYPE;

    /// [`HttpTransport`] backed by a pooled `reqwest::Client`.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(timeout: Duration) -> Result<Self, CallError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .pool_max_idle_per_host(32)
                .build()
                .map_err(|err| CallError::transient(format!("failed to build HTTP client: {err}")))?;
            Ok(Self { client })
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CallError> {
            let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|err| {
                CallError::new(
                    crate::error::FailureKind::PermanentClient,
                    format!("invalid method {}: {err}", request.method),
                )
            })?;

            let mut builder = self.client.request(method, &request.url);
            let has_content_type = request
                .headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
            if !has_content_type {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|err| {
                let what = if err.is_timeout() { "timed out" } else { "failed" };
                CallError::transient(format!("request to {} {what}: {err}", request.url))
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|err| CallError::transient(format!("reading response body failed: {err}")))?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;

    #[test]
    fn coalescing_key_covers_method_url_and_body() {
        let get = HttpRequest::get("https://api.example.com/api/earnings");
        assert_eq!(get.coalescing_key(), "GET:https://api.example.com/api/earnings:");

        let post = HttpRequest::post_json("https://api.example.com/api/claim", &json!({"id": 1}));
        let key = post.coalescing_key();
        let digest = key
            .strip_prefix("POST:https://api.example.com/api/claim:")
            .unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(get.coalescing_key(), key);

        let again = HttpRequest::post_json("https://api.example.com/api/claim", &json!({"id": 1}));
        assert_eq!(again.coalescing_key(), key);
    }

    #[test]
    fn binary_bodies_get_distinct_keys() {
        let a = HttpRequest::new("POST", "http://svc/api/upload").with_body(vec![0xffu8]);
        let b = HttpRequest::new("POST", "http://svc/api/upload").with_body(vec![0xfeu8]);
        assert_ne!(a.coalescing_key(), b.coalescing_key());

        let empty = HttpRequest::new("POST", "http://svc/api/upload").with_body(Vec::<u8>::new());
        assert_ne!(empty.coalescing_key(), HttpRequest::new("POST", "http://svc/api/upload").coalescing_key());
    }

    #[test]
    fn endpoint_is_the_url_path() {
        assert_eq!(endpoint_path("https://host:8080/api/earnings?user=1"), "/api/earnings");
        assert_eq!(endpoint_path("https://host"), "/");
        assert_eq!(endpoint_path("/api/referrals#top"), "/api/referrals");
        assert_eq!(
            HttpRequest::get("http://localhost/api/profile").endpoint(),
            "/api/profile"
        );
    }

    #[test]
    fn error_for_status_classifies() {
        let ok = HttpResponse::json_body(200, &json!({"totalEarnings": 1234}));
        let ok = ok.error_for_status().unwrap();
        let body: serde_json::Value = ok.json().unwrap();
        assert_eq!(body["totalEarnings"], 1234);

        let limited = HttpResponse::new(429, "slow down")
            .with_header("Retry-After", "12")
            .error_for_status()
            .unwrap_err();
        assert_eq!(limited.kind, FailureKind::RateLimited);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(12)));

        let server = HttpResponse::new(502, "bad gateway").error_for_status().unwrap_err();
        assert_eq!(server.kind, FailureKind::TransientUpstream);
        assert!(server.message.contains("bad gateway"));
    }

    #[test]
    fn header_lookup_ignores_case() {
        let resp = HttpResponse::new(200, "").with_header("X-Request-Id", "abc");
        assert_eq!(resp.header("x-request-id"), Some("abc"));
        assert_eq!(resp.header("missing"), None);
    }
}
