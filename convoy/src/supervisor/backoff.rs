//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_ratio,
        )
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// `min(max, base * 2^attempt)` without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let factor = 2u64.saturating_pow(attempt.min(63));
        let ms = base_ms.saturating_mul(factor);
        Duration::from_millis(ms).min(self.max)
    }

    /// Nominal delay ± `jitter_ratio`, never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter_ratio == 0.0 {
            return nominal;
        }
        let spread = nominal.as_secs_f64() * self.jitter_ratio;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let secs = (nominal.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(secs).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
