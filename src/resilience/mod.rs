//! Retry policy for message delivery.
//!
//! Backoff is exponential in whole time units with a fixed ceiling:
//! after failed attempt `k` the caller waits `min(2^k, cap)` units before
//! attempt `k + 1`. There is no jitter and no wait before the first attempt.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_unit: Duration,
    max_backoff_units: u64,
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff_unit: Duration, max_backoff_units: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
            max_backoff_units,
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff in time units after failed attempt `attempt` (1-based).
    pub fn backoff_units(&self, attempt: u32) -> u64 {
        2u64.saturating_pow(attempt).min(self.max_backoff_units)
    }

    /// Wall-clock delay after failed attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let units = u32::try_from(self.backoff_units(attempt)).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(units)
    }

    /// Returns true if another attempt follows `attempt`.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_unit, config.max_backoff_units)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Suspends the calling task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
