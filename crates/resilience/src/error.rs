use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Broad classification of a failed call.
///
/// The kind decides whether the retrier re-attempts, whether the circuit
/// breaker counts the failure, and what the user should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, timeout or 5xx answer.
    TransientUpstream,
    /// Rejected locally because the endpoint's circuit is open.
    CircuitOpen,
    /// Upstream answered 429.
    RateLimited,
    /// Upstream answered with a 4xx other than 429.
    PermanentClient,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientUpstream => write!(f, "transient upstream failure"),
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::PermanentClient => write!(f, "client error"),
        }
    }
}

/// How a failure should be presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFacing {
    /// Expected to self-resolve; show a soft "try again shortly" state.
    TryAgainShortly,
    /// A real error worth surfacing.
    Error,
}

/// Failure of a call issued through this crate.
///
/// Cloneable so one settled outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: FailureKind,
    pub message: String,
    /// HTTP status of the upstream answer, when there was one.
    pub status: Option<u16>,
    /// Server supplied hint for when to try again.
    pub retry_after: Option<Duration>,
}

impl CallError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientUpstream, message)
    }

    pub fn circuit_open(endpoint: &str, retry_in: Duration) -> Self {
        let mut err = Self::new(
            FailureKind::CircuitOpen,
            format!(
                "circuit open for {endpoint}, next probe in {}ms",
                retry_in.as_millis()
            ),
        );
        err.retry_after = Some(retry_in);
        err
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let kind = match status {
            429 => FailureKind::RateLimited,
            400..=499 => FailureKind::PermanentClient,
            _ => FailureKind::TransientUpstream,
        };
        Self {
            kind,
            message: format!("HTTP {status}: {}", reason.into()),
            status: Some(status),
            retry_after: if kind == FailureKind::RateLimited {
                retry_after
            } else {
                None
            },
        }
    }

    /// Whether the backoff retrier may re-attempt after this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind != FailureKind::PermanentClient
    }

    /// Whether this failure counts against the endpoint's circuit.
    pub fn trips_circuit(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::TransientUpstream | FailureKind::RateLimited
        )
    }

    pub fn user_facing(&self) -> UserFacing {
        match self.kind {
            FailureKind::PermanentClient => UserFacing::Error,
            FailureKind::TransientUpstream | FailureKind::CircuitOpen | FailureKind::RateLimited => {
                UserFacing::TryAgainShortly
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            CallError::from_status(503, "Service Unavailable", None).kind,
            FailureKind::TransientUpstream
        );
        assert_eq!(
            CallError::from_status(404, "Not Found", None).kind,
            FailureKind::PermanentClient
        );
        let limited = CallError::from_status(429, "Too Many Requests", Some(Duration::from_secs(7)));
        assert_eq!(limited.kind, FailureKind::RateLimited);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(limited.status, Some(429));
    }

    #[test]
    fn retry_after_is_kept_only_for_rate_limits() {
        let err = CallError::from_status(500, "boom", Some(Duration::from_secs(1)));
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn permanent_errors_are_not_retried_and_do_not_trip() {
        let err = CallError::from_status(400, "Bad Request", None);
        assert!(!err.is_retryable());
        assert!(!err.trips_circuit());
        assert_eq!(err.user_facing(), UserFacing::Error);
    }

    #[test]
    fn circuit_open_is_soft_and_retryable_but_never_trips() {
        let err = CallError::circuit_open("/api/earnings", Duration::from_secs(30));
        assert!(err.is_retryable());
        assert!(!err.trips_circuit());
        assert_eq!(err.user_facing(), UserFacing::TryAgainShortly);
        assert!(err.to_string().contains("circuit open"));
        assert!(err.to_string().contains("/api/earnings"));
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = CallError::transient("connection reset");
        assert_eq!(err.to_string(), "transient upstream failure: connection reset");
    }
}
