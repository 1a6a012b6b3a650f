/// Exponential backoff schedule for the resilient client.
///
/// Attempt `n` (1-based) waits `base * 2^(n-1)` before the next attempt,
/// capped at `max_delay` and never below `min_delay`. The schedule is a
/// pure function of the attempt number so it can be tested in isolation
/// from any call site.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    min_delay: Duration,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, min_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            min_delay,
        }
    }

    /// Returns the delay to wait after the given (1-based) attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        delay.max(self.min_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(10),
            Duration::from_millis(200),
        )
    }
}
