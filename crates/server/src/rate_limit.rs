//! Fixed-window rate limiting keyed by (client identity, route).
//!
//! Every request under `/api/` increments the counter for its caller and
//! path. Once a window's count passes the route quota the caller is rejected
//! until the window rolls over. Expired windows are purged by [`EdgeRateLimiter::sweep`].

use dashmap::DashMap;
use resilience::{default_clock, SharedClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Requests allowed per window for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Quota {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_ms: 60_000,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Route table: exact path match, falling back to a default quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteQuotas {
    pub default: Quota,
    pub routes: HashMap<String, Quota>,
}

impl Default for RouteQuotas {
    fn default() -> Self {
        let routes = [
            ("/api/claim-rewards", 5),
            ("/api/complete-task", 20),
            ("/api/unclaimed-rewards", 10),
            ("/api/referrals", 15),
            ("/api/auth/login", 100),
            ("/api/auth/signup", 100),
        ]
        .into_iter()
        .map(|(path, max)| (path.to_owned(), Quota::per_minute(max)))
        .collect();

        Self {
            default: Quota::per_minute(30),
            routes,
        }
    }
}

impl RouteQuotas {
    pub fn for_path(&self, path: &str) -> Quota {
        self.routes.get(path).copied().unwrap_or(self.default)
    }

    /// Bounded metrics label for `path`: the configured route, or `"default"`.
    pub fn route_label(&self, path: &str) -> &str {
        self.routes
            .get_key_value(path)
            .map(|(route, _)| route.as_str())
            .unwrap_or("default")
    }

    pub fn with_route(mut self, path: impl Into<String>, quota: Quota) -> Self {
        self.routes.insert(path.into(), quota);
        self
    }
}

/// Request count for one (identity, route) pair in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowCounter {
    pub count: u32,
    pub window_reset_at: Instant,
}

impl RateWindowCounter {
    fn fresh(now: Instant, quota: &Quota) -> Self {
        Self {
            count: 0,
            window_reset_at: now + quota.window(),
        }
    }

    /// Roll the window if it has expired, then count one request.
    fn hit(&mut self, now: Instant, quota: &Quota) {
        if now >= self.window_reset_at {
            *self = Self::fresh(now, quota);
        }
        self.count = self.count.saturating_add(1);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_reset_at
    }
}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests seen in the current window, this one included.
    pub count: u32,
    /// Time until the window rolls over.
    pub reset_after: Duration,
}

impl RateDecision {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    /// Whole seconds a rejected caller should wait, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        (self.reset_after.as_millis() as u64).div_ceil(1000)
    }
}

/// Table of rate windows shared by every request handler.
#[derive(Debug)]
pub struct EdgeRateLimiter {
    quotas: RouteQuotas,
    clock: SharedClock,
    windows: DashMap<String, RateWindowCounter>,
}

impl EdgeRateLimiter {
    pub fn new(quotas: RouteQuotas) -> Self {
        Self::with_clock(quotas, default_clock())
    }

    pub fn with_clock(quotas: RouteQuotas, clock: SharedClock) -> Self {
        Self {
            quotas,
            clock,
            windows: DashMap::new(),
        }
    }

    pub fn quotas(&self) -> &RouteQuotas {
        &self.quotas
    }

    /// Count a request from `identity` to `path` and decide whether it may proceed.
    ///
    /// The increment and the comparison happen under the entry lock, so
    /// concurrent handlers never both take the last slot.
    pub fn check(&self, identity: &str, path: &str) -> RateDecision {
        let quota = self.quotas.for_path(path);
        let now = self.clock.now();
        let key = format!("{identity}:{path}");

        let mut window = self
            .windows
            .entry(key)
            .or_insert_with(|| RateWindowCounter::fresh(now, &quota));
        window.hit(now, &quota);

        RateDecision {
            allowed: window.count <= quota.max_requests,
            limit: quota.max_requests,
            count: window.count,
            reset_after: window.window_reset_at.saturating_duration_since(now),
        }
    }

    /// Drop every expired window. Returns how many were purged.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Number of live (identity, route) windows.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Default for EdgeRateLimiter {
    fn default() -> Self {
        Self::new(RouteQuotas::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience::ManualClock;
    use std::sync::Arc;

    fn limiter(quotas: RouteQuotas) -> (EdgeRateLimiter, ManualClock) {
        let clock = ManualClock::new();
        (
            EdgeRateLimiter::with_clock(quotas, Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn default_table_matches_route_profiles() {
        let quotas = RouteQuotas::default();
        assert_eq!(quotas.for_path("/api/claim-rewards").max_requests, 5);
        assert_eq!(quotas.for_path("/api/complete-task").max_requests, 20);
        assert_eq!(quotas.for_path("/api/unclaimed-rewards").max_requests, 10);
        assert_eq!(quotas.for_path("/api/referrals").max_requests, 15);
        assert_eq!(quotas.for_path("/api/auth/login").max_requests, 100);
        assert_eq!(quotas.for_path("/api/anything-else"), Quota::per_minute(30));
    }

    #[test]
    fn route_label_is_bounded_by_the_quota_table() {
        let quotas = RouteQuotas::default();
        assert_eq!(quotas.route_label("/api/claim-rewards"), "/api/claim-rewards");
        assert_eq!(quotas.route_label("/api/random-8f3a1c"), "default");
        assert_eq!(quotas.route_label("/api/claim-rewards/extra"), "default");
    }

    #[test]
    fn rejects_only_requests_past_the_quota() {
        let (limiter, _) = limiter(RouteQuotas::default());

        for n in 1..=5 {
            let decision = limiter.check("10.0.0.1", "/api/claim-rewards");
            assert!(decision.allowed, "request {n} should pass");
            assert_eq!(decision.remaining(), 5 - n);
        }
        for _ in 0..3 {
            let decision = limiter.check("10.0.0.1", "/api/claim-rewards");
            assert!(!decision.allowed);
            assert_eq!(decision.remaining(), 0);
        }
    }

    #[test]
    fn window_rollover_restores_the_full_quota() {
        let quotas = RouteQuotas::default().with_route(
            "/api/claim-rewards",
            Quota {
                max_requests: 2,
                window_ms: 1000,
            },
        );
        let (limiter, clock) = limiter(quotas);

        assert!(limiter.check("ip", "/api/claim-rewards").allowed);
        clock.advance(Duration::from_millis(400));
        assert!(limiter.check("ip", "/api/claim-rewards").allowed);
        let rejected = limiter.check("ip", "/api/claim-rewards");
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_after, Duration::from_millis(600));
        assert_eq!(rejected.retry_after_secs(), 1);

        clock.advance(Duration::from_millis(600));
        assert!(limiter.check("ip", "/api/claim-rewards").allowed);
        assert!(limiter.check("ip", "/api/claim-rewards").allowed);
        assert!(!limiter.check("ip", "/api/claim-rewards").allowed);
    }

    #[test]
    fn identities_and_routes_are_counted_separately() {
        let quotas = RouteQuotas::default().with_route("/api/claim-rewards", Quota::per_minute(1));
        let (limiter, _) = limiter(quotas);

        assert!(limiter.check("a", "/api/claim-rewards").allowed);
        assert!(!limiter.check("a", "/api/claim-rewards").allowed);
        assert!(limiter.check("b", "/api/claim-rewards").allowed);
        assert!(limiter.check("a", "/api/referrals").allowed);
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn sweep_purges_only_expired_windows() {
        let quotas = RouteQuotas::default()
            .with_route(
                "/api/short",
                Quota {
                    max_requests: 10,
                    window_ms: 1_000,
                },
            )
            .with_route(
                "/api/long",
                Quota {
                    max_requests: 10,
                    window_ms: 10_000,
                },
            );
        let (limiter, clock) = limiter(quotas);
        limiter.check("a", "/api/short");
        limiter.check("b", "/api/short");
        limiter.check("a", "/api/long");

        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.sweep(), 0);
    }

    #[test]
    fn concurrent_handlers_never_exceed_the_quota() {
        let quotas = RouteQuotas::default().with_route("/api/claim-rewards", Quota::per_minute(50));
        let limiter = Arc::new(EdgeRateLimiter::new(quotas));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check("shared", "/api/claim-rewards").allowed)
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
