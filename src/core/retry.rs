use rand::Rng;
use std::time::Duration;

/// Exponential backoff with an upper bound and additive jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0 disables jitter)
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt, without jitter
    ///
    /// `failures` counts the attempts that have failed so far; after attempt
    /// `n` the wait is `base × 2^n`, capped at `max`.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let delay = self.base_delay(failures);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter * rand::thread_rng().gen::<f64>());
        delay + extra
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 0.25)
    }
}
