//! Retry delays for the replication loop

use std::time::Duration;

/// Exponential backoff: `initial * 2^failures`, capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        // 2^20 * initial is far past any sensible cap
        let exp = self.consecutive_failures.min(20);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        self.initial
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Record a success.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Failures since the last success
    pub fn attempts(&self) -> u32 {
        self.consecutive_failures
    }
}
