//! Partitioned Consumer - ordered, failure-isolated message consumption
//!
//! This crate turns a partitioned event stream into strictly ordered work per
//! partition. Every message is either processed or dead-lettered before its
//! offset is committed.

pub mod client;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod monitoring;
pub mod partition;
pub mod retry;
pub mod worker;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;
#[cfg(test)]
mod tests;

pub use client::{
    BrokerConsumer, BrokerError, BrokerEvent, BrokerProducer, Message, Offset, TopicPartition,
};
pub use config::{ConsumerConfig, DlqConfig};
pub use consumer::{Consumer, ConsumerBuilder};
pub use error::{ConsumerError, EnqueueError, ProcessingError, Result};
pub use handler::Handler;
pub use monitoring::{MetricsAggregator, MonitoringConfig, ProcessingEvent};
pub use partition::PartitionKey;
pub use retry::{Backoff, BackoffStrategy, ConfiguredBackoff, RetryConfig};
pub use worker::{PartitionWorker, WorkerState};
