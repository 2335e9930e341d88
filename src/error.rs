//! Error types for the partitioned consumer

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

use crate::client::{BrokerError, Message};
use crate::retry::Retryable;

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Consumer is already running")]
    AlreadyRunning,

    #[error("Consumer is closed")]
    Closed,

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Fatal broker error, consumer must be recreated: {0}")]
    Fatal(#[source] BrokerError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Dead-letter delivery failed: {0}")]
    DlqDeliveryFailed(String),

    #[error("Dead-letter delivery not confirmed within {0:?}")]
    DlqDeliveryTimeout(Duration),

    #[error("Offset commit failed: {0}")]
    CommitFailed(String),

    #[error("Message processing timed out after {0:?}")]
    ProcessingTimeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    pub fn is_config(&self) -> bool {
        matches!(self, ConsumerError::ConfigError(_))
    }
}

impl From<JoinError> for ConsumerError {
    fn from(err: JoinError) -> Self {
        ConsumerError::Other(err.into())
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Failure reported by a [`Handler`](crate::Handler) for a single message
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::HardFailure(err.into())
    }
}

impl Retryable for ProcessingError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ProcessingError::HardFailure(_))
    }
}

/// A message a worker would not accept, handed back to the caller
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Partition worker is shutting down")]
    ShuttingDown(Message),

    #[error("Partition worker intake is closed")]
    Closed(Message),

    #[error("Enqueue cancelled while waiting for capacity")]
    Cancelled(Message),
}

impl EnqueueError {
    pub fn into_message(self) -> Message {
        match self {
            EnqueueError::ShuttingDown(m)
            | EnqueueError::Closed(m)
            | EnqueueError::Cancelled(m) => m,
        }
    }
}
