//! Cooldown gate for user-triggered actions.
//!
//! Suppresses rapid re-invocation of the same action (double clicks on a
//! claim or stop button) regardless of what the network is doing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::clock::{default_clock, SharedClock};

/// Configuration for the action gate.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ActionGateConfig {
    /// Cooldown applied by [`ActionGate::try_fire_default`].
    #[serde(with = "crate::serde_millis")]
    pub default_cooldown: Duration,
}

impl Default for ActionGateConfig {
    fn default() -> Self {
        Self {
            default_cooldown: Duration::from_secs(2),
        }
    }
}

/// Per-key cooldown tracker.
#[derive(Debug)]
pub struct ActionGate {
    config: ActionGateConfig,
    clock: SharedClock,
    last_fired: DashMap<String, Instant>,
}

impl ActionGate {
    pub fn new(config: ActionGateConfig) -> Self {
        Self::with_clock(config, default_clock())
    }

    pub fn with_clock(config: ActionGateConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            last_fired: DashMap::new(),
        }
    }

    /// Returns `true` and stamps the key if the action may run now.
    ///
    /// A rejected attempt leaves the original stamp alone, so hammering the
    /// button does not extend the cooldown.
    pub fn try_fire(&self, key: &str, cooldown: Duration) -> bool {
        let now = self.clock.now();
        match self.last_fired.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut stamp) => {
                if now.duration_since(*stamp.get()) >= cooldown {
                    stamp.insert(now);
                    true
                } else {
                    tracing::trace!(action = key, "action suppressed by cooldown");
                    false
                }
            }
        }
    }

    pub fn try_fire_default(&self, key: &str) -> bool {
        self.try_fire(key, self.config.default_cooldown)
    }

    /// Time left before `key` may fire again. Does not consume the gate.
    pub fn remaining_cooldown(&self, key: &str, cooldown: Duration) -> Duration {
        let now = self.clock.now();
        self.last_fired
            .get(key)
            .map(|stamp| cooldown.saturating_sub(now.duration_since(*stamp)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn reset(&self, key: &str) {
        self.last_fired.remove(key);
    }

    pub fn reset_all(&self) {
        self.last_fired.clear();
    }
}

impl Default for ActionGate {
    fn default() -> Self {
        Self::new(ActionGateConfig::default())
    }
}
