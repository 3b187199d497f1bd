//! In-flight request coalescing with a short-lived result cache.
//!
//! Callers that ask for the same key while an operation is pending share its
//! outcome instead of issuing duplicate upstream work. Settled outcomes are
//! memoized for a caller-chosen TTL so near-simultaneous callers get an
//! immediate answer.
//!
//! The upstream future is driven on its own task. It settles, and its pending
//! entry is removed, even if every caller that was waiting on it goes away.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::clock::{default_clock, SharedClock};
use crate::error::CallError;

/// Configuration for request coalescing.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// How long an in-flight operation stays joinable.
    #[serde(with = "crate::serde_millis")]
    pub dedup_window: Duration,
    /// Default lifetime of a settled outcome.
    #[serde(with = "crate::serde_millis")]
    pub cache_ttl: Duration,
    /// Whether failed outcomes are memoized too.
    pub cache_failures: bool,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(2),
            cache_failures: false,
        }
    }
}

impl CoalescerConfig {
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_cache_failures(mut self, cache_failures: bool) -> Self {
        self.cache_failures = cache_failures;
        self
    }
}

/// Per-call knobs for [`RequestCoalescer::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Overrides [`CoalescerConfig::cache_ttl`] for this lookup.
    pub cache_ttl: Option<Duration>,
    /// Skip the cache. Still joins an operation that is already in flight.
    pub force_refresh: bool,
}

impl ExecuteOptions {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Table sizes, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CoalescerStats {
    pub pending: usize,
    pub cached: usize,
}

type Outcome<T> = Result<T, CallError>;

struct PendingOperation<T> {
    id: u64,
    started_at: Instant,
    /// Callers in join order; the leader is first.
    waiters: Vec<oneshot::Sender<Outcome<T>>>,
}

struct CachedResult<T> {
    value: Outcome<T>,
    /// Start of the operation that produced `value`.
    started_at: Instant,
    completed_at: Instant,
}

struct Inner<T> {
    config: CoalescerConfig,
    clock: SharedClock,
    pending: DashMap<String, PendingOperation<T>>,
    /// Operations that outlived the dedup window and were replaced under
    /// their key. Their callers are still owed an answer.
    superseded: DashMap<u64, PendingOperation<T>>,
    cache: DashMap<String, CachedResult<T>>,
    next_id: AtomicU64,
}

/// Merges concurrent identical requests into one upstream operation.
pub struct RequestCoalescer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoalescerConfig) -> Self {
        Self::with_clock(config, default_clock())
    }

    pub fn with_clock(config: CoalescerConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                pending: DashMap::new(),
                superseded: DashMap::new(),
                cache: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.inner.config
    }

    /// Run `factory` under `key`, or share an existing outcome for it.
    ///
    /// An in-flight operation younger than the dedup window is joined. Otherwise
    /// a cached outcome younger than the TTL is returned. Only when neither
    /// exists is `factory` invoked.
    pub async fn execute<F, Fut>(&self, key: &str, factory: F, options: ExecuteOptions) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let inner = &self.inner;
        let ttl = options.cache_ttl.unwrap_or(inner.config.cache_ttl);
        let now = inner.clock.now();
        let (tx, rx) = oneshot::channel();

        let launch = match inner.pending.entry(key.to_owned()) {
            Entry::Occupied(mut entry)
                if now.duration_since(entry.get().started_at) < inner.config.dedup_window =>
            {
                tracing::debug!(
                    key,
                    waiters = entry.get().waiters.len(),
                    "joining in-flight request"
                );
                entry.get_mut().waiters.push(tx);
                None
            }
            entry => {
                if !options.force_refresh {
                    if let Some(hit) = inner.cached(key, ttl, now) {
                        tracing::trace!(key, "serving cached outcome");
                        return hit;
                    }
                }

                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                let operation = PendingOperation {
                    id,
                    started_at: now,
                    waiters: vec![tx],
                };
                match entry {
                    Entry::Occupied(mut stale) => {
                        tracing::debug!(key, "in-flight request outlived dedup window, replacing");
                        let old = stale.insert(operation);
                        inner.superseded.insert(old.id, old);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(operation);
                    }
                }
                Some(id)
            }
        };

        if let Some(id) = launch {
            let upstream = match std::panic::catch_unwind(AssertUnwindSafe(factory)) {
                Ok(upstream) => upstream,
                Err(panic) => {
                    inner.settle(key, id, Err(CallError::transient("upstream operation panicked")));
                    std::panic::resume_unwind(panic);
                }
            };
            let driver = Arc::clone(inner);
            let key = key.to_owned();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(upstream)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(key = %key, "coalesced upstream operation panicked");
                        Err(CallError::transient("upstream operation panicked"))
                    });
                driver.settle(&key, id, outcome);
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(CallError::transient(
                "coalesced operation was dropped before settling",
            ))
        })
    }

    /// Drop the cached outcome for `key`.
    pub fn invalidate(&self, key: &str) {
        self.inner.cache.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.inner.cache.clear();
    }

    /// Purge cache entries older than `ttl`; returns how many were removed.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = self.inner.clock.now();
        let before = self.inner.cache.len();
        self.inner
            .cache
            .retain(|_, cached| now.duration_since(cached.completed_at) < ttl);
        before.saturating_sub(self.inner.cache.len())
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            pending: self.inner.pending.len() + self.inner.superseded.len(),
            cached: self.inner.cache.len(),
        }
    }
}

impl<T> Inner<T>
where
    T: Clone,
{
    fn cached(&self, key: &str, ttl: Duration, now: Instant) -> Option<Outcome<T>> {
        {
            let hit = self.cache.get(key)?;
            if now.duration_since(hit.completed_at) < ttl {
                return Some(hit.value.clone());
            }
        }
        self.cache
            .remove_if(key, |_, cached| now.duration_since(cached.completed_at) >= ttl);
        None
    }

    fn settle(&self, key: &str, id: u64, outcome: Outcome<T>) {
        let operation = match self.pending.remove_if(key, |_, op| op.id == id) {
            Some((_, op)) => Some(op),
            None => self.superseded.remove(&id).map(|(_, op)| op),
        };
        let Some(operation) = operation else {
            tracing::warn!(key, id, "settled operation had no pending entry");
            return;
        };

        if outcome.is_ok() || self.config.cache_failures {
            self.remember(key, operation.started_at, &outcome);
        }

        if let Err(err) = &outcome {
            tracing::debug!(key, waiters = operation.waiters.len(), error = %err, "coalesced request failed");
        }
        for waiter in operation.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Cache `outcome` unless the entry already holds the result of a later operation.
    fn remember(&self, key: &str, started_at: Instant, outcome: &Outcome<T>) {
        let fresh = CachedResult {
            value: outcome.clone(),
            started_at,
            completed_at: self.clock.now(),
        };
        match self.cache.entry(key.to_owned()) {
            Entry::Occupied(mut slot) => {
                if slot.get().started_at > started_at {
                    tracing::debug!(key, "late outcome of a superseded operation not cached");
                } else {
                    slot.insert(fresh);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
    }
}
