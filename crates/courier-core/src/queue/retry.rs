//! Retry policy: backoff delays for failed deliveries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and downward jitter.
///
/// `delay = base_delay * multiplier^(attempts - 1)`, capped at `max_delay`,
/// then scaled by a uniform factor in `[1 - jitter, 1]` so a sink outage does
/// not make every failed task retry on the same tick.
///
/// The constants are configuration, not contract: the upstream scheduler this
/// replaces never specified its schedule, so operators are expected to tune
/// these per sink.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`. Zero disables jitter (useful in tests).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have already
    /// run (1-indexed; 0 is treated as 1).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        Duration::from_secs_f64(capped * factor)
    }

    /// Same policy without jitter, for deterministic assertions.
    #[cfg(test)]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}
