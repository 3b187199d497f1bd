use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect and heartbeat policy for one realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Base delay before the first reconnect; doubles on every further attempt.
    #[serde(with = "crate::serde_millis")]
    pub reconnect_interval: Duration,
    /// Consecutive reconnects allowed before the channel stays closed.
    pub max_reconnect_attempts: u32,
    #[serde(with = "crate::serde_millis")]
    pub heartbeat_interval: Duration,
    /// Silence tolerated after a ping before the channel counts as lost.
    /// `None` disables the check.
    #[serde(with = "crate::serde_millis::option")]
    pub pong_timeout: Option<Duration>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: None,
        }
    }
}

impl RealtimeConfig {
    /// Device telemetry channel.
    pub fn device() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: None,
        }
    }

    /// User session channel.
    pub fn session() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(2),
            max_reconnect_attempts: 15,
            heartbeat_interval: Duration::from_secs(20),
            pong_timeout: None,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = Some(timeout);
        self
    }

    /// Delay before reconnect number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.reconnect_interval
            .saturating_mul(2_u32.saturating_pow(exponent))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("realtime.heartbeat_interval must be positive".into());
        }
        if self.reconnect_interval.is_zero() {
            return Err("realtime.reconnect_interval must be positive".into());
        }
        if matches!(self.pong_timeout, Some(t) if t.is_zero()) {
            return Err("realtime.pong_timeout must be positive when set".into());
        }
        Ok(())
    }
}
