use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// `min(base * 2^attempt + jitter, cap)`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(factor);
        exponential.saturating_add(jitter).min(self.cap)
    }

    pub fn allows_attempt(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
