//! Jittered exponential backoff policy for the commit retry loop.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for retrying version-conflicted commits.
///
/// The delay before attempt `n + 1` is a uniformly random duration in
/// `0..=initial_delay * backoff_exponent^n`, capped at `max_delay`. Full
/// jitter spreads concurrent losers apart instead of letting them collide
/// again in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay multiplied by the exponent each attempt. Default 5ms.
    pub initial_delay: Duration,
    /// Total attempt budget, including the first try. Default 10.
    pub max_attempts: u32,
    /// Upper bound on any single delay. Default 10s.
    pub max_delay: Duration,
    /// Exponential growth factor. Default 2.
    pub backoff_exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_attempts: 10,
            max_delay: Duration::from_secs(10),
            backoff_exponent: 2,
        }
    }
}

impl RetryPolicy {
    /// Compute the jittered delay to sleep after failed attempt `attempt`
    /// (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self
            .initial_delay
            .saturating_mul(self.backoff_exponent.saturating_pow(attempt))
            .min(self.max_delay);

        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}
