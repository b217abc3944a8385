use crate::error::CoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Zero disables the per-attempt timeout.
    pub attempt_timeout_ms: u64,
}

impl RetryPolicy {
    pub fn session_fetch() -> Self {
        Self {
            retries: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
            jitter: true,
            attempt_timeout_ms: 25_000,
        }
    }

    pub fn final_send() -> Self {
        Self {
            retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter: true,
            attempt_timeout_ms: 5_000,
        }
    }

    /// Delay before retry number `tries` (1-based).
    pub fn delay_for(&self, tries: u32) -> Duration {
        let factor = 1u64 << (tries.saturating_sub(1).min(16));
        let base = self.base_delay_ms.saturating_mul(factor);
        let capped = base.min(self.max_delay_ms);
        let jitter = if self.jitter {
            rand::thread_rng().gen_range(0..=capped / 2 + 1)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        if self.attempt_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.attempt_timeout_ms))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::session_fetch()
    }
}

/// Decides when a failing app-state collection is retried from scratch and
/// when it is abandoned for the current call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncFailurePolicy {
    pub max_attempts: u32,
    pub abandon_on_not_found: bool,
    pub abandon_on_structural: bool,
    pub not_found_cooldown_ms: u64,
}

impl SyncFailurePolicy {
    /// `attempts` counts failures so far, including the one being classified.
    pub fn is_irrecoverable(&self, attempts: u32, err: &CoreError) -> bool {
        if attempts >= self.max_attempts {
            return true;
        }
        match err {
            _ if err.is_not_found() => self.abandon_on_not_found,
            CoreError::Structural(_) => self.abandon_on_structural,
            _ => false,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.not_found_cooldown_ms)
    }
}

impl Default for SyncFailurePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            abandon_on_not_found: true,
            abandon_on_structural: true,
            not_found_cooldown_ms: 60_000,
        }
    }
}
