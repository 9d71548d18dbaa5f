//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Upper bound on any single backoff.
const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff between attempts of the same task.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    pub multiplier: f64,
}

impl RetryPolicy {
    /// No backoff at all. Requeued tasks are claimable immediately.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// `base_delay * multiplier^(attempts - 1)`; `attempts` is 1-indexed.
    ///
    /// With base=2s, multiplier=2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}
