//! Broker client seam
//!
//! The consumer never speaks a broker protocol itself. It drives an external
//! client through [`BrokerConsumer`] (poll, assign, commit) and publishes
//! dead-letter records through [`BrokerProducer`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A single header attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message read from the broker
///
/// Handed to exactly one partition worker and read-only from then on.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub headers: Vec<Header>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Time since the broker stamped the message, if it carries a timestamp
    /// not in the future
    pub fn age(&self) -> Option<Duration> {
        self.timestamp.and_then(|ts| Utc::now().signed_duration_since(ts).to_std().ok())
    }

    /// Value of the first header named `key`
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.key == key).map(|h| &h.value)
    }
}

/// Starting position for an assigned partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Beginning,
    End,
    /// Resume from the group's committed offset
    Stored,
    Offset(i64),
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: Offset::Invalid,
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }
}

/// Whether an error originated in the local client or came back from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    Local,
    Broker,
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerErrorKind::Local => write!(f, "local"),
            BrokerErrorKind::Broker => write!(f, "broker"),
        }
    }
}

/// Error reported by the broker client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
    /// The client can no longer be used and must be recreated
    pub fatal: bool,
}

impl BrokerError {
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Local,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Broker,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Broker,
            message: message.into(),
            fatal: true,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == BrokerErrorKind::Local
    }
}

/// Events surfaced by a single poll of the broker client
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Message(Message),
    PartitionsAssigned(Vec<TopicPartition>),
    PartitionsRevoked(Vec<TopicPartition>),
    Error(BrokerError),
    OffsetsCommitted {
        offsets: Vec<TopicPartition>,
        error: Option<BrokerError>,
    },
}

/// A record to publish
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub headers: Vec<Header>,
}

/// Broker confirmation that a record was persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next event
    async fn poll(&self, timeout: Duration) -> Option<BrokerEvent>;

    async fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    async fn incremental_unassign(&self, partitions: &[TopicPartition])
        -> Result<(), BrokerError>;

    /// True when the current assignment was lost involuntarily
    fn assignment_lost(&self) -> bool;

    /// Synchronously commit the offset following `message`
    async fn commit_message(&self, message: &Message) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Publish a record, resolving once the broker confirms delivery
    async fn produce(&self, record: ProducerRecord) -> Result<DeliveryReport, BrokerError>;
}
