use std::time::Duration;

/// Capped exponential retry schedule.
///
/// Each call to [`Backoff::next_delay`] returns the current delay and doubles
/// it for next time, never exceeding `max`. The sequence is non-decreasing
/// until [`Backoff::reset`] brings it back to `base`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
