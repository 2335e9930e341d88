//! Retry and backoff functionality for message processing

mod backoff;
mod error;

pub use backoff::{Backoff, BackoffStrategy, ConfiguredBackoff};
pub use error::RetryError;

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Classifies an operation failure as worth another attempt or not
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; zero means a single attempt
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Growth factor between exponential delays
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    pub strategy: BackoffStrategy,
    /// Overall budget across all attempts and delays
    pub max_elapsed_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            strategy: BackoffStrategy::Exponential,
            max_elapsed_time: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryConfig {
    /// Total attempts including the first try
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err("retry.initial_backoff must be greater than zero".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "retry.initial_backoff ({:?}) must not exceed retry.max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "retry.jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            ));
        }
        if self.max_elapsed_time.is_some_and(|d| d.is_zero()) {
            return Err("retry.max_elapsed_time must be greater than zero when set".to_string());
        }
        Ok(())
    }

    /// Backoff policy described by this configuration
    pub fn backoff(&self) -> ConfiguredBackoff {
        ConfiguredBackoff::new(self)
    }
}

async fn shutdown_requested(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation with backoff
    ///
    /// The operation receives the 1-based attempt number. A running attempt is
    /// never interrupted; the shutdown signal only cuts short the delay between
    /// attempts.
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        mut operation: F,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts();

        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let e = match operation(self.attempts).await {
                Ok(value) => {
                    debug!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !e.is_retryable() {
                warn!(
                    attempts = self.attempts,
                    error = %e,
                    "Permanent failure, will not retry"
                );
                return Err(RetryError::Permanent(self.attempts, e.to_string()));
            }

            if self.attempts >= max_attempts {
                warn!(
                    attempts = self.attempts,
                    error = %e,
                    "Maximum retry attempts exceeded"
                );
                return Err(RetryError::MaxRetriesExceeded(self.attempts, e.to_string()));
            }

            let delay = self.backoff.next_delay(self.attempts - 1);
            if let Some(budget) = self.config.max_elapsed_time {
                if started.elapsed().saturating_add(delay) > budget {
                    warn!(
                        attempts = self.attempts,
                        budget_ms = ?budget.as_millis(),
                        error = %e,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::ElapsedTimeExceeded(budget, e.to_string()));
                }
            }

            warn!(
                attempt = self.attempts,
                delay_ms = ?delay.as_millis(),
                error = %e,
                "Operation failed, retrying after delay"
            );

            select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = shutdown_requested(shutdown) => {
                    debug!("Retry interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    impl Retryable for &str {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            jitter_factor: 0.1,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_success() -> anyhow::Result<()> {
        let config = fast_config(3);
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry
            .retry(
                |_| {
                    let value = counter_clone.clone();
                    async move {
                        let attempts = value.fetch_add(1, Ordering::SeqCst);
                        if attempts < 2 {
                            Err("not yet")
                        } else {
                            Ok("success")
                        }
                    }
                },
                &mut shutdown_rx,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 3);

        drop(shutdown_tx);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_counts_first_attempt() -> anyhow::Result<()> {
        let config = fast_config(2);
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = retry
            .retry(|_| async { Err("always fails") }, &mut shutdown_rx)
            .await;

        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded(3, _))));
        assert_eq!(result.unwrap_err().last_error(), Some("always fails"));
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() -> anyhow::Result<()> {
        let config = fast_config(0);
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = retry
            .retry(|_| async { Err("fails") }, &mut shutdown_rx)
            .await;

        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded(1, _))));
        assert_eq!(retry.attempts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_retrying() -> anyhow::Result<()> {
        let config = fast_config(5);
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = retry
            .retry(
                |_| async {
                    Err(crate::ProcessingError::hard(anyhow::anyhow!(
                        "malformed payload"
                    )))
                },
                &mut shutdown_rx,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(1, _))));
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_shutdown_interrupts_backoff() -> anyhow::Result<()> {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            max_elapsed_time: None,
            ..Default::default()
        };
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move {
            retry
                .retry(|_| async { Err::<(), _>("never succeeds") }, &mut shutdown_rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true)?;

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await??;
        assert!(matches!(result, Err(RetryError::Interrupted)));

        Ok(())
    }

    #[tokio::test]
    async fn test_running_attempt_is_not_interrupted() -> anyhow::Result<()> {
        let config = fast_config(3);
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move {
            retry
                .retry(
                    |_| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, &str>("finished")
                    },
                    &mut shutdown_rx,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true)?;

        assert_eq!(handle.await?.ok(), Some("finished"));
        Ok(())
    }

    #[tokio::test]
    async fn test_elapsed_budget_stops_retries() -> anyhow::Result<()> {
        let config = RetryConfig {
            max_retries: 100,
            initial_backoff: Duration::from_millis(40),
            max_backoff: Duration::from_millis(40),
            strategy: BackoffStrategy::Constant,
            max_elapsed_time: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let backoff = config.backoff();
        let mut retry = RetryHandle::new(config, backoff);
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = retry
            .retry(|_| async { Err("still down") }, &mut shutdown_rx)
            .await;

        assert!(matches!(result, Err(RetryError::ElapsedTimeExceeded(_, _))));
        assert!(retry.attempts() < 5);
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let config = RetryConfig {
            initial_backoff: Duration::from_secs(20),
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("initial_backoff"));

        let config = RetryConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("multiplier"));

        let config = RetryConfig {
            multiplier: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("multiplier"));

        let config = RetryConfig {
            max_elapsed_time: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
