//! Test utilities and mock implementations for testing the consumer


use std::future::Future;
use std::time::Duration;

use crate::client::{BrokerEvent, Message, ProducerRecord, TopicPartition};
use crate::config::ConsumerConfig;
use crate::worker::MESSAGE_ID_HEADER;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test message with a payload and message id derived from its position
    pub fn create_test_message(topic: &str, partition: i32, offset: i64) -> Message {
        Message::new(topic, partition, offset)
            .with_key(format!("key-{partition}"))
            .with_payload(format!("data-{offset}"))
            .with_header(MESSAGE_ID_HEADER, format!("{topic}-{partition}-{offset}"))
    }

    /// Consecutive messages for one partition starting at offset zero
    pub fn create_test_messages(topic: &str, partition: i32, count: usize) -> Vec<Message> {
        (0..count as i64)
            .map(|offset| Self::create_test_message(topic, partition, offset))
            .collect()
    }

    pub fn assigned(topic: &str, partitions: &[i32]) -> BrokerEvent {
        BrokerEvent::PartitionsAssigned(Self::topic_partitions(topic, partitions))
    }

    pub fn revoked(topic: &str, partitions: &[i32]) -> BrokerEvent {
        BrokerEvent::PartitionsRevoked(Self::topic_partitions(topic, partitions))
    }

    pub fn topic_partitions(topic: &str, partitions: &[i32]) -> Vec<TopicPartition> {
        partitions
            .iter()
            .map(|p| TopicPartition::new(topic, *p))
            .collect()
    }

    /// Header value of a produced record as UTF-8
    pub fn header_str(record: &ProducerRecord, name: &str) -> Option<String> {
        record
            .headers
            .iter()
            .find(|h| h.key == name)
            .map(|h| String::from_utf8_lossy(&h.value).into_owned())
    }
}

/// Configuration with short timings for tests
pub fn test_config(topics: &[&str]) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(topics.iter().copied(), "usage-dlq");
    config.poll_timeout = Duration::from_millis(10);
    config.processing_timeout = Some(Duration::from_secs(2));
    config.stop_wait_timeout = Duration::from_secs(1);
    config.dlq.delivery_timeout = Duration::from_secs(1);
    config.retry.max_retries = 2;
    config.retry.initial_backoff = Duration::from_millis(5);
    config.retry.max_backoff = Duration::from_millis(20);
    config.retry.max_elapsed_time = Some(Duration::from_secs(1));
    config
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn wait_for_condition<F, Fut>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while !check().await {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_messages() {
        let messages = TestUtils::create_test_messages("usage", 3, 3);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].offset, 2);
        assert_eq!(messages[0].partition, 3);
        assert_eq!(
            messages[1].header(MESSAGE_ID_HEADER).map(|v| v.as_ref()),
            Some(&b"usage-3-1"[..])
        );
    }

    #[test]
    fn test_config_is_valid() {
        assert!(test_config(&["usage"]).validate().is_ok());
    }
}
