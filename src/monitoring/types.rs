use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::partition::PartitionKey;

/// Longest summary window the aggregator accepts
pub const MAX_METRICS_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the monitoring event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether monitoring events are emitted
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often the aggregator logs per-partition summaries
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Represents a monitoring event from the consumer
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Partition this event relates to
    pub partition: PartitionKey,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

/// The different types of events that can occur during consumption
#[derive(Debug, Clone)]
pub enum ProcessingEventType {
    /// Terminal outcome of the handler for one message
    MessageProcessed {
        offset: i64,
        event_name: String,
        success: bool,
        attempts: u32,
        duration: Duration,
        error: Option<String>,
    },
    DeadLettered {
        offset: i64,
        event_name: String,
        success: bool,
        error: Option<String>,
    },
    Commit {
        offset: i64,
        success: bool,
        error: Option<String>,
    },
    PanicRecovered {
        offset: i64,
        message_id: String,
        details: String,
    },
    MessageDropped {
        offset: i64,
        reason: String,
    },
    /// Intake channel was full and the coordinator had to wait
    Backpressure {
        offset: i64,
    },
    Partition {
        event_type: PartitionEventType,
        details: Option<String>,
    },
}

/// Lifecycle events of a partition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEventType {
    /// Partition assigned and worker started
    Assigned,
    /// Partition revoked by a rebalance
    Revoked,
    /// Partition revoked involuntarily
    Lost,
    /// Worker finished within the stop wait
    Stopped,
    /// Worker did not finish in time and was force-stopped
    ForceStopped,
}

impl ProcessingEvent {
    fn new(partition: PartitionKey, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            partition,
            event_type,
        }
    }

    pub fn message_processed(
        partition: PartitionKey,
        offset: i64,
        event_name: String,
        success: bool,
        attempts: u32,
        duration: Duration,
        error: Option<String>,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::MessageProcessed {
                offset,
                event_name,
                success,
                attempts,
                duration,
                error,
            },
        )
    }

    pub fn dead_lettered(
        partition: PartitionKey,
        offset: i64,
        event_name: String,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::DeadLettered {
                offset,
                event_name,
                success,
                error,
            },
        )
    }

    pub fn commit(
        partition: PartitionKey,
        offset: i64,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::Commit {
                offset,
                success,
                error,
            },
        )
    }

    pub fn panic_recovered(
        partition: PartitionKey,
        offset: i64,
        message_id: String,
        details: String,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::PanicRecovered {
                offset,
                message_id,
                details,
            },
        )
    }

    pub fn message_dropped(
        partition: PartitionKey,
        offset: i64,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::MessageDropped {
                offset,
                reason: reason.into(),
            },
        )
    }

    pub fn backpressure(partition: PartitionKey, offset: i64) -> Self {
        Self::new(partition, ProcessingEventType::Backpressure { offset })
    }

    /// Create a new partition lifecycle event
    pub fn partition_event(
        partition: PartitionKey,
        event_type: PartitionEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::Partition {
                event_type,
                details,
            },
        )
    }
}
