//! Reconnect policy
//!
//! Pure computation: given how many consecutive attempts have failed since
//! the last successful session, decide whether to try again and how long to
//! wait first. No clock, no randomness.

use std::time::Duration;

use crate::config::ReconnectSettings;

/// Outcome of consulting the policy after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make another attempt
    Retry { attempt: u32, delay: Duration },

    /// Attempt budget spent
    GiveUp { attempts: u32 },
}

/// Capped exponential backoff with a bounded attempt budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Build from the `[reconnect]` config section
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.max_attempts,
        )
    }

    /// Total connection attempts allowed before giving up
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff after the `attempt`-th consecutive failure: `min(base * 2^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decide what follows `failures` consecutive failed attempts
    pub fn decide(&self, failures: u32) -> ReconnectDecision {
        if failures >= self.max_attempts {
            ReconnectDecision::GiveUp { attempts: failures }
        } else {
            ReconnectDecision::Retry {
                attempt: failures,
                delay: self.delay(failures),
            }
        }
    }
}
