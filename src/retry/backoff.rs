use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use super::RetryConfig;

/// Delay policy between attempts of a retried operation
pub trait Backoff: Send + Sync {
    /// Delay before the retry following failed attempt number `attempt` (0-based)
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// How the delay between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Constant,
}

/// Backoff described by a [`RetryConfig`]
///
/// Exponential delays grow by `multiplier` per failed attempt and are capped at
/// `max_backoff` both before and after jitter. Constant delays always wait
/// `initial_backoff`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredBackoff {
    strategy: BackoffStrategy,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ConfiguredBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy,
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    fn exponential_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let grown = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        grown.min(self.max.as_millis() as f64)
    }

    fn jittered_ms(&self, delay_ms: f64) -> f64 {
        let spread = delay_ms * self.jitter_factor;
        if spread <= 0.0 {
            return delay_ms;
        }
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        (delay_ms + jitter).clamp(0.0, self.max.as_millis() as f64)
    }
}

impl Backoff for ConfiguredBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Constant => self.initial,
            BackoffStrategy::Exponential => {
                let base_ms = self.exponential_ms(attempt);
                Duration::from_millis(self.jittered_ms(base_ms) as u64)
            }
        };
        trace!(
            attempt,
            strategy = ?self.strategy,
            delay_ms = ?delay.as_millis(),
            "Calculated backoff delay"
        );
        delay
    }
}
