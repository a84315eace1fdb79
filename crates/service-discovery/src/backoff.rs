//! Capped exponential backoff with jitter for registration recovery

use crate::config::BackoffConfig;
use std::time::Duration;

/// Delay schedule between failed recovery attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff schedule starting at the first attempt
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay_ms(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - jitter + fastrand::f64() * 2.0 * jitter
        } else {
            1.0
        };
        let delay_ms = (base * factor).min(self.config.max_ms as f64).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// Restart the schedule after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let multiplier = self.config.multiplier.max(1.0);
        let delay = self.config.initial_ms as f64 * multiplier.powi(attempt.min(64) as i32);
        delay.min(self.config.max_ms as f64)
    }
}
