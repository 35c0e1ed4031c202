use std::time::Duration;

/// Exponential backoff between failed publishes of the same series
///
/// Unlike a sleeping backoff, this only computes delays: the dispatcher
/// keeps scanning other series while a failed one waits out its delay.
/// There is no retry limit, a series is never dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    /// Consecutive failures after which the sink is reported as degraded
    degraded_after: u32,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, degraded_after: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            degraded_after,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(2_u32.pow(exponent))
            .min(self.max_delay)
    }

    pub fn is_degraded(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.degraded_after
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}
