use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a ceiling and random jitter between the reconnect attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Backoff {
            initial: Duration::from_millis(config.initial_interval_ms),
            max: Duration::from_millis(config.max_interval_ms.max(config.initial_interval_ms)),
            multiplier: config.multiplier.max(1.0),
            jitter: if config.jitter.is_finite() {
                config.jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// The delay before the attempt without jitter. Attempts are counted from 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);

        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// The delay with jitter, it never exceeds the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);

        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }

        let spread = base.as_millis() as f64 * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (base.as_millis() as f64 + offset).clamp(0.0, self.max.as_millis() as f64);

        Duration::from_millis(millis as u64)
    }
}
