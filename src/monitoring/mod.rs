//! Monitoring for tracking consumer throughput and health
//!
//! Metrics are published through the `metrics` facade. A finer-grained event
//! stream is available through an optional channel, which [`MetricsAggregator`]
//! can fold into per-partition summaries.

mod aggregator;
pub mod instruments;
mod types;

pub use aggregator::{MetricsAggregator, PartitionMetrics};
pub use types::{
    MonitoringConfig, PartitionEventType, ProcessingEvent, ProcessingEventType,
    MAX_METRICS_INTERVAL,
};
