//! Retry logic with exponential backoff for transient failures.
//!
//! Failed operations are re-issued with delays of `base_delay * 2^attempt` plus
//! uniform random jitter, so a burst of failing clients does not retry in lockstep.

use std::future::Future;
use std::time::Duration;

use crate::error::CallError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Base delay between retries (exponentially increased).
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    #[serde(with = "crate::serde_millis")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Create a new config with custom max retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Create a new config with custom base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the jitter ceiling. `Duration::ZERO` disables jitter.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
    }

    /// Full delay before retry number `attempt + 1`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        self.backoff(attempt).saturating_add(jitter)
    }
}

/// Result of a retry operation.
#[derive(Debug, Clone)]
pub struct RetryResult<T> {
    /// The final result (Ok if succeeded, the last failure otherwise).
    pub result: Result<T, CallError>,
    /// Number of attempts made (1 = no retries needed).
    pub attempts: u32,
    /// Total duration spent on all attempts, delays included.
    pub total_duration: Duration,
}

impl<T> RetryResult<T> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Convert to a standard Result.
    pub fn into_result(self) -> Result<T, CallError> {
        self.result
    }
}

/// Execute an async operation with retry logic.
///
/// The operation receives the 0-based attempt number. Non-retryable failures
/// (see [`CallError::is_retryable`]) are returned at once without spending the
/// remaining budget.
///
/// # Example
///
/// ```ignore
/// use resilience::{execute_with_retry, RetryConfig};
///
/// async fn example() {
///     let config = RetryConfig::default();
///     let result = execute_with_retry(&config, |attempt| async move {
///         // Your async operation here
///         Ok::<_, resilience::CallError>(attempt)
///     }).await;
/// }
/// ```
pub async fn execute_with_retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> RetryResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                };
            }
            Err(error) if attempt < config.max_retries && error.is_retryable() => {
                let delay = config.delay_for(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                return RetryResult {
                    result: Err(error),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                };
            }
        }
    }
}

/// Retry `operation` up to `max_retries` times with `base_delay` backoff.
pub async fn retry<T, F, Fut>(
    operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T, CallError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let config = RetryConfig::default()
        .with_max_retries(max_retries)
        .with_base_delay(base_delay);
    execute_with_retry(&config, operation).await.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_eventually() {
        let config = RetryConfig::default().with_max_retries(3);
        let mut counter = 0;

        let result = execute_with_retry(&config, |_attempt| {
            counter += 1;
            let current = counter;
            async move {
                if current < 3 {
                    Err(CallError::transient("not yet"))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert!(result.succeeded());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_failing_operation_runs_max_retries_plus_one() {
        for k in 0..4 {
            let config = RetryConfig::default().with_max_retries(k);
            let result: RetryResult<()> = execute_with_retry(&config, |attempt| async move {
                Err(CallError::transient(format!("failure {attempt}")))
            })
            .await;

            assert!(!result.succeeded());
            assert_eq!(result.attempts, k + 1);
            assert_eq!(result.into_result().unwrap_err().message, format!("failure {k}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delays_grow_exponentially_from_base() {
        let config = RetryConfig::default()
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(1000));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&stamps);
        let _: RetryResult<()> = execute_with_retry(&config, move |_| {
            recorder.lock().unwrap().push(Instant::now());
            async { Err(CallError::transient("down")) }
        })
        .await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 4);
        for (attempt, pair) in stamps.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let floor = config.backoff(attempt as u32);
            assert!(gap >= floor, "gap {gap:?} below {floor:?}");
            assert!(gap <= floor + config.jitter, "gap {gap:?} above jitter ceiling");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let config = RetryConfig::default().with_max_retries(5);
        let result: RetryResult<()> = execute_with_retry(&config, |_| async {
            Err(CallError::from_status(403, "Forbidden", None))
        })
        .await;

        assert_eq!(result.attempts, 1);
        assert_eq!(result.result.unwrap_err().kind, FailureKind::PermanentClient);
    }

    #[tokio::test(start_paused = true)]
    async fn no_delay_on_success() {
        let result = retry(|_| async { Ok("immediate success") }, 2, Duration::from_secs(1)).await;
        assert_eq!(result, Ok("immediate success"));
    }

    #[test]
    fn backoff_doubles_and_jitter_stays_bounded() {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_millis(500))
            .with_jitter(Duration::from_millis(100));
        assert_eq!(config.backoff(0), Duration::from_millis(500));
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(3), Duration::from_millis(4000));

        for _ in 0..100 {
            let delay = config.delay_for(2);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2100));
        }

        let no_jitter = config.with_jitter(Duration::ZERO);
        assert_eq!(no_jitter.delay_for(1), Duration::from_millis(1000));
    }
}
