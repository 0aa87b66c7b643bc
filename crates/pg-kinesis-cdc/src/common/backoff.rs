//! Jittered exponential backoff for publish retries.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// Each attempt doubles the ceiling (capped at `max`); the actual delay
/// is drawn uniformly from `[base, ceiling]` so that concurrent retriers
/// do not thunder in lockstep.
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl RetryBackoff {
    /// Create a new backoff sequence.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Get the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt += 1;

        let base_ms = self.base.as_millis() as u64;
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms <= base_ms {
            return self.base;
        }
        Duration::from_millis(rand::thread_rng().gen_range(base_ms..=ceiling_ms))
    }

    /// Reset the sequence.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
