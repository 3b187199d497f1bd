//! Composite upstream client: retry around coalescing around circuit breaking.
//!
//! ```text
//! call ──► Retrier ──► Coalescer ──► CircuitBreaker ──► HttpTransport
//! ```
//!
//! Each layer can be switched off per call through [`CallOptions`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreakerManager, CircuitSnapshot, EndpointStats};
use crate::clock::{default_clock, SharedClock};
use crate::coalesce::{CoalescerStats, ExecuteOptions, RequestCoalescer};
use crate::config::ResilienceConfig;
use crate::error::CallError;
use crate::retry::{execute_with_retry, RetryConfig};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Per-call switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub enable_dedup: bool,
    pub enable_circuit_breaker: bool,
    pub enable_retry: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Overrides the coalescer's default cache TTL.
    pub cache_ttl: Option<Duration>,
    pub force_refresh: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            enable_dedup: true,
            enable_circuit_breaker: true,
            enable_retry: true,
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            cache_ttl: None,
            force_refresh: false,
        }
    }
}

impl CallOptions {
    /// Every protection switched off: one raw attempt.
    pub fn direct() -> Self {
        Self {
            enable_dedup: false,
            enable_circuit_breaker: false,
            enable_retry: false,
            ..Self::default()
        }
    }

    pub fn without_retry(mut self) -> Self {
        self.enable_retry = false;
        self
    }

    pub fn without_dedup(mut self) -> Self {
        self.enable_dedup = false;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.enable_circuit_breaker = false;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Client that issues upstream calls through the resilience stack.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
    coalescer: RequestCoalescer<HttpResponse>,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryConfig,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ResilienceConfig) -> Self {
        Self::with_clock(transport, config, default_clock())
    }

    pub fn with_clock(
        transport: Arc<dyn HttpTransport>,
        config: &ResilienceConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            transport,
            coalescer: RequestCoalescer::with_clock(config.coalescer, Arc::clone(&clock)),
            breakers: Arc::new(CircuitBreakerManager::with_clock(
                config.circuit_breaker,
                clock,
            )),
            retry: config.retry,
        }
    }

    /// Options seeded from this client's retry settings.
    pub fn default_options(&self) -> CallOptions {
        CallOptions::default().with_retries(self.retry.max_retries, self.retry.base_delay)
    }

    /// Issue `request`, returning the 2xx answer or a classified failure.
    pub async fn call(
        &self,
        request: HttpRequest,
        options: CallOptions,
    ) -> Result<HttpResponse, CallError> {
        if !options.enable_retry {
            return self.attempt(&request, &options).await;
        }

        let retry = RetryConfig {
            max_retries: options.max_retries,
            base_delay: options.base_delay,
            jitter: self.retry.jitter,
        };
        let outcome = execute_with_retry(&retry, |_| self.attempt(&request, &options)).await;
        if outcome.attempts > 1 {
            tracing::debug!(
                url = %request.url,
                attempts = outcome.attempts,
                succeeded = outcome.succeeded(),
                "call finished after retries"
            );
        }
        outcome.into_result()
    }

    async fn attempt(
        &self,
        request: &HttpRequest,
        options: &CallOptions,
    ) -> Result<HttpResponse, CallError> {
        let upstream = self.upstream(request.clone(), options.enable_circuit_breaker);
        if !options.enable_dedup {
            return upstream.await;
        }

        let exec = ExecuteOptions {
            cache_ttl: options.cache_ttl,
            force_refresh: options.force_refresh,
        };
        self.coalescer
            .execute(&request.coalescing_key(), move || upstream, exec)
            .await
    }

    fn upstream(
        &self,
        request: HttpRequest,
        with_breaker: bool,
    ) -> impl Future<Output = Result<HttpResponse, CallError>> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let breaker = with_breaker.then(|| self.breakers.get_or_create(&request.endpoint()));

        async move {
            let send = move || async move {
                transport
                    .send(request)
                    .await
                    .and_then(HttpResponse::error_for_status)
            };
            match breaker {
                Some(breaker) => breaker.call(send).await,
                None => send().await,
            }
        }
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.breakers.stats()
    }

    pub fn circuit_status(&self) -> Vec<CircuitSnapshot> {
        self.breakers.status()
    }

    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }

    /// Forget the cached answer for `request`.
    pub fn invalidate(&self, request: &HttpRequest) {
        self.coalescer.invalidate(&request.coalescing_key());
    }

    pub fn reset_circuits(&self) {
        self.breakers.reset_all();
    }
}
