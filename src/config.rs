//! Consumer configuration
//!
//! Loading is left to the embedding service; every struct here derives serde
//! traits with field defaults so it can be read from any serde format.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConsumerError, Result};
use crate::monitoring::{MonitoringConfig, MAX_METRICS_INTERVAL};
use crate::retry::RetryConfig;

/// Dead-letter settings. Dead-lettering is mandatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub topic: String,
    /// How long to wait for the broker to confirm a dead-letter record
    pub delivery_timeout: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: String::new(),
            delivery_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the partitioned consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Topics to subscribe to
    pub topics: Vec<String>,
    pub dlq: DlqConfig,
    pub retry: RetryConfig,
    /// Upper bound on handling one message, retries included
    pub processing_timeout: Option<Duration>,
    /// Maximum time a single broker poll may block
    pub poll_timeout: Duration,
    /// How long revocation and shutdown wait for workers before force-stopping them
    pub stop_wait_timeout: Duration,
    /// Capacity of each partition worker's intake channel
    pub channel_buffer_size: usize,
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            dlq: DlqConfig::default(),
            retry: RetryConfig::default(),
            processing_timeout: Some(Duration::from_secs(10)),
            poll_timeout: Duration::from_millis(100),
            stop_wait_timeout: Duration::from_secs(45),
            channel_buffer_size: 100,
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(
        topics: impl IntoIterator<Item = impl Into<String>>,
        dlq_topic: impl Into<String>,
    ) -> Self {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            dlq: DlqConfig {
                topic: dlq_topic.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Topics with duplicates removed, first occurrence wins
    pub fn unique_topics(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.topics
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(config_error("topics must not be empty"));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(config_error("topics must not contain blank names"));
        }

        if !self.dlq.enabled {
            return Err(config_error("dlq.enabled must be true, dead-lettering is mandatory"));
        }
        if self.dlq.topic.trim().is_empty() {
            return Err(config_error("dlq.topic must not be empty"));
        }
        if self.topics.contains(&self.dlq.topic) {
            return Err(config_error(format!(
                "dlq.topic '{}' must not be one of the consumed topics",
                self.dlq.topic
            )));
        }
        if self.dlq.delivery_timeout.is_zero() {
            return Err(config_error("dlq.delivery_timeout must be greater than zero"));
        }

        self.retry.validate().map_err(ConsumerError::ConfigError)?;

        if self.processing_timeout.is_some_and(|d| d.is_zero()) {
            return Err(config_error("processing_timeout must be greater than zero when set"));
        }
        if self.poll_timeout.is_zero() {
            return Err(config_error("poll_timeout must be greater than zero"));
        }
        if self.channel_buffer_size == 0 {
            return Err(config_error("channel_buffer_size must be greater than zero"));
        }
        if self.monitoring.enabled && self.monitoring.channel_size == 0 {
            return Err(config_error("monitoring.channel_size must be greater than zero"));
        }
        let interval = self.monitoring.metrics_interval;
        if interval.is_zero() || interval > MAX_METRICS_INTERVAL {
            return Err(config_error(format!(
                "monitoring.metrics_interval must be within (0, {MAX_METRICS_INTERVAL:?}], \
                 got {interval:?}"
            )));
        }

        Ok(())
    }
}

fn config_error(msg: impl Into<String>) -> ConsumerError {
    ConsumerError::ConfigError(msg.into())
}
