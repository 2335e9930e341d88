use super::types::{PartitionEventType, ProcessingEvent, ProcessingEventType, MAX_METRICS_INTERVAL};
use std::collections::HashMap;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::partition::PartitionKey;

/// Holds aggregated metrics for a single partition
#[derive(Debug, Clone)]
pub struct PartitionMetrics {
    // Message processing metrics
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub retry_attempts: u64,
    pub processing_time: Duration,

    // Dead-letter metrics
    pub dead_lettered: u64,
    pub dlq_failures: u64,

    // Commit metrics
    pub commits_succeeded: u64,
    pub commits_failed: u64,

    pub panics_recovered: u64,
    pub messages_dropped: u64,
    pub backpressure_events: u64,
    pub force_stops: u64,

    // Performance metrics
    pub avg_processing_time: Duration,
    pub max_processing_time: Duration,

    // Window information
    pub window_start: Instant,
    pub last_updated: Instant,
}

impl Default for PartitionMetrics {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            messages_processed: 0,
            messages_failed: 0,
            retry_attempts: 0,
            processing_time: Duration::default(),
            dead_lettered: 0,
            dlq_failures: 0,
            commits_succeeded: 0,
            commits_failed: 0,
            panics_recovered: 0,
            messages_dropped: 0,
            backpressure_events: 0,
            force_stops: 0,
            avg_processing_time: Duration::default(),
            max_processing_time: Duration::default(),
            window_start: now,
            last_updated: now,
        }
    }
}

const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Aggregates monitoring events into per-partition metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<PartitionKey, PartitionMetrics>>>,
    window_duration: Duration,
    monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    /// Create a new metrics aggregator
    ///
    /// The window is clamped to between one millisecond and [`MAX_METRICS_INTERVAL`].
    pub fn new(
        window_duration: Duration,
        monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
    ) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration: window_duration.clamp(MIN_WINDOW, MAX_METRICS_INTERVAL),
            monitoring_rx,
        }
    }

    /// Process incoming events and emit summaries until the channel closes
    pub async fn run(mut self) {
        let mut interval = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        self.emit_metrics().await;
                        debug!("Monitoring channel closed, aggregator stopping");
                        break;
                    }
                },

                _ = interval.tick() => {
                    self.emit_metrics().await;
                }
            }
        }
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let mut metrics = self.metrics.write().await;
        let partition_metrics = metrics.entry(event.partition.clone()).or_default();

        match event.event_type {
            ProcessingEventType::MessageProcessed {
                success,
                attempts,
                duration,
                ..
            } => {
                if success {
                    partition_metrics.messages_processed += 1;
                } else {
                    partition_metrics.messages_failed += 1;
                }
                partition_metrics.retry_attempts += u64::from(attempts.saturating_sub(1));

                partition_metrics.processing_time += duration;
                let count =
                    partition_metrics.messages_processed + partition_metrics.messages_failed;
                partition_metrics.avg_processing_time =
                    partition_metrics.processing_time.div_f64(count as f64);
                if duration > partition_metrics.max_processing_time {
                    partition_metrics.max_processing_time = duration;
                }
            }
            ProcessingEventType::DeadLettered {
                offset,
                success,
                error,
                ..
            } => {
                if success {
                    partition_metrics.dead_lettered += 1;
                } else {
                    partition_metrics.dlq_failures += 1;
                    warn!(
                        partition = %event.partition,
                        offset = offset,
                        error = ?error,
                        "Dead-letter delivery failed"
                    );
                }
            }
            ProcessingEventType::Commit {
                offset,
                success,
                error,
            } => {
                if success {
                    partition_metrics.commits_succeeded += 1;
                    trace!(partition = %event.partition, offset = offset, "Commit successful");
                } else {
                    partition_metrics.commits_failed += 1;
                    warn!(
                        partition = %event.partition,
                        offset = offset,
                        error = ?error,
                        "Commit failed"
                    );
                }
            }
            ProcessingEventType::PanicRecovered { .. } => {
                partition_metrics.panics_recovered += 1;
            }
            ProcessingEventType::MessageDropped { .. } => {
                partition_metrics.messages_dropped += 1;
            }
            ProcessingEventType::Backpressure { .. } => {
                partition_metrics.backpressure_events += 1;
            }
            ProcessingEventType::Partition {
                event_type,
                details,
            } => match event_type {
                PartitionEventType::Assigned => {
                    debug!(partition = %event.partition, "Partition assigned");
                }
                PartitionEventType::Revoked | PartitionEventType::Lost => {
                    info!(
                        partition = %event.partition,
                        event = ?event_type,
                        details = ?details,
                        "Partition revoked"
                    );
                }
                PartitionEventType::Stopped => {
                    debug!(partition = %event.partition, "Partition worker stopped");
                }
                PartitionEventType::ForceStopped => {
                    partition_metrics.force_stops += 1;
                    warn!(
                        partition = %event.partition,
                        details = ?details,
                        "Partition worker force-stopped"
                    );
                }
            },
        }

        partition_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (partition, metrics) in metrics.iter() {
            // Skip partitions with no recent activity
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                partition = %partition,
                messages_processed = metrics.messages_processed,
                messages_failed = metrics.messages_failed,
                retry_attempts = metrics.retry_attempts,
                avg_processing_time_ms = %metrics.avg_processing_time.as_millis(),
                max_processing_time_ms = %metrics.max_processing_time.as_millis(),
                dead_lettered = metrics.dead_lettered,
                dlq_failures = metrics.dlq_failures,
                commits_succeeded = metrics.commits_succeeded,
                commits_failed = metrics.commits_failed,
                panics_recovered = metrics.panics_recovered,
                "Metrics for window"
            );

            if metrics.dlq_failures > 0 {
                warn!(
                    partition = %partition,
                    failures = metrics.dlq_failures,
                    "Dead-letter failures detected, messages were committed without a DLQ copy"
                );
            }

            if metrics.commits_failed > 0 {
                warn!(
                    partition = %partition,
                    failures = metrics.commits_failed,
                    "Commit failures detected"
                );
            }
        }
        drop(metrics);

        let mut metrics = self.metrics.write().await;
        metrics.retain(|_, m| m.last_updated.elapsed() <= self.window_duration * 2);
    }

    /// Shared view of the metrics that stays readable while [`run`](Self::run) owns the aggregator
    pub fn shared_metrics(&self) -> Arc<RwLock<HashMap<PartitionKey, PartitionMetrics>>> {
        self.metrics.clone()
    }

    /// Get current metrics for all partitions
    pub async fn get_metrics(&self) -> HashMap<PartitionKey, PartitionMetrics> {
        self.metrics.read().await.clone()
    }

    /// Get metrics for a specific partition
    pub async fn get_partition_metrics(
        &self,
        partition: &PartitionKey,
    ) -> Option<PartitionMetrics> {
        self.metrics.read().await.get(partition).cloned()
    }
}
