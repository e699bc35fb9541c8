//! Retry policy for transport sends and recipient resolution.
//!
//! Exponential backoff capped at `max_delay`, randomized within
//! ±`jitter_factor` so that many retries scheduled together spread out.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use campaign_core::config::{DispatchConfig, ResolutionConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt. Doubles on every further failure.
    #[serde(default = "defaults::base_delay")]
    pub base_delay: Duration,

    #[serde(default = "defaults::max_delay")]
    pub max_delay: Duration,

    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay: defaults::base_delay(),
            max_delay: defaults::max_delay(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    pub fn from_dispatch(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            jitter_factor: config.retry_jitter_factor,
        }
    }

    /// Resolution retries are scheduled on the campaign clock, so no jitter.
    pub fn from_resolution(config: &ResolutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs(config.base_backoff_secs),
            max_delay: Duration::from_secs(config.max_backoff_secs),
            jitter_factor: 0.0,
        }
    }

    /// Policy that never waits between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempts: u32) -> u32 {
        self.max_attempts.saturating_sub(attempts)
    }

    /// Backoff before the next attempt, given `attempts` failures so far
    /// (1-indexed: the first retry waits `base_delay`).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        let capped = raw.min(self.max_delay);
        if self.jitter_factor <= 0.0 || capped.is_zero() {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        capped.mul_f64((1.0 + jitter).max(0.0))
    }
}

mod defaults {
    use std::time::Duration;

    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay() -> Duration {
        Duration::from_millis(200)
    }

    pub const fn max_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }
}
