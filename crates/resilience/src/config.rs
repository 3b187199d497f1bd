use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::action_gate::ActionGateConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::coalesce::CoalescerConfig;
use crate::retry::RetryConfig;

/// Settings for every client-side component in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub coalescer: CoalescerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub action_gate: ActionGateConfig,
    /// Per-request timeout applied by the HTTP transport.
    #[serde(with = "crate::serde_millis")]
    pub http_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            coalescer: CoalescerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            action_gate: ActionGateConfig::default(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl ResilienceConfig {
    /// Reject settings that would make a component degenerate.
    pub fn validate(&self) -> Result<(), String> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be at least 1".into());
        }
        if self.circuit_breaker.open_duration.is_zero() {
            return Err("circuit_breaker.open_duration must be positive".into());
        }
        if self.coalescer.dedup_window.is_zero() {
            return Err("coalescer.dedup_window must be positive".into());
        }
        if self.http_timeout.is_zero() {
            return Err("http_timeout must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = ResilienceConfig::default();
        assert_eq!(cfg.coalescer.dedup_window, Duration::from_secs(5));
        assert_eq!(cfg.coalescer.cache_ttl, Duration::from_secs(2));
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.circuit_breaker.open_duration, Duration::from_secs(30));
        assert_eq!(cfg.circuit_breaker.probe_timeout, Duration::from_secs(5));
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(1));
        assert_eq!(cfg.action_gate.default_cooldown, Duration::from_secs(2));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: ResilienceConfig = serde_json::from_str(
            r#"{"circuit_breaker": {"failure_threshold": 3, "open_duration": 1000, "probe_timeout": 500}}"#,
        )
        .unwrap();
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker.open_duration, Duration::from_millis(1000));
        assert_eq!(cfg.retry, RetryConfig::default());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut cfg = ResilienceConfig::default();
        cfg.circuit_breaker.failure_threshold = 0;
        assert!(cfg.validate().is_err());
    }
}
