//! Consumer - the poll loop and the partition worker registry
//!
//! A single poll task owns the broker session and the map of partition
//! workers. Rebalance events start and stop workers, messages are routed to the
//! worker owning their partition, and nothing else touches the registry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::{
    BrokerConsumer, BrokerError, BrokerEvent, BrokerProducer, Message, Offset, TopicPartition,
};
use crate::config::ConsumerConfig;
use crate::dlq;
use crate::error::{ConsumerError, EnqueueError, Result};
use crate::handler::Handler;
use crate::monitoring::instruments::{self, UNKNOWN_EVENT};
use crate::monitoring::{PartitionEventType, ProcessingEvent};
use crate::partition::PartitionKey;
use crate::worker::{signalled, PartitionWorker};

/// Everything a worker needs to process, dead-letter and commit a message
pub(crate) struct ProcessingContext {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) broker: Arc<dyn BrokerConsumer>,
    pub(crate) producer: Arc<dyn BrokerProducer>,
    pub(crate) config: ConsumerConfig,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
    closing: AtomicBool,
}

impl ProcessingContext {
    pub(crate) fn new(
        handler: Arc<dyn Handler>,
        broker: Arc<dyn BrokerConsumer>,
        producer: Arc<dyn BrokerProducer>,
        config: ConsumerConfig,
        monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
    ) -> Self {
        Self {
            handler,
            broker,
            producer,
            config,
            monitoring_tx,
            closing: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Event name reported by the handler, or the unknown label
    pub(crate) fn event_name(&self, message: &Message) -> String {
        self.handler
            .extract_event_name(message)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_EVENT.to_string())
    }

    /// Monitoring is best-effort; a full channel drops the event
    pub(crate) fn send_monitoring_event(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.monitoring_tx {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    debug!(partition = %event.partition, "Monitoring channel full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("Monitoring channel closed");
                }
            }
        }
    }

    pub(crate) async fn send_to_dlq(&self, message: &Message, error: &str) -> Result<()> {
        if self.is_closing() {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Consumer closing, skipping dead-letter delivery"
            );
            return Ok(());
        }

        let key = PartitionKey::from(message);
        let event_name = self.event_name(message);
        let record = dlq::build_dead_letter(&self.config.dlq.topic, message, error);
        let delivery_timeout = self.config.dlq.delivery_timeout;

        let delivery = tokio::time::timeout(delivery_timeout, self.producer.produce(record));
        let result = match delivery.await {
            Ok(Ok(report)) => {
                info!(
                    partition = %key,
                    offset = message.offset,
                    dlq_topic = %self.config.dlq.topic,
                    dlq_partition = report.partition,
                    dlq_offset = report.offset,
                    "Message sent to dead-letter topic"
                );
                instruments::record_dead_letter(&event_name);
                Ok(())
            }
            Ok(Err(e)) => Err(ConsumerError::DlqDeliveryFailed(e.to_string())),
            Err(_) => Err(ConsumerError::DlqDeliveryTimeout(delivery_timeout)),
        };

        self.send_monitoring_event(ProcessingEvent::dead_lettered(
            key,
            message.offset,
            event_name,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        ));
        result
    }

    pub(crate) async fn commit_message(&self, message: &Message) -> Result<()> {
        let key = PartitionKey::from(message);
        match self.broker.commit_message(message).await {
            Ok(()) => {
                debug!(partition = %key, offset = message.offset, "Committed offset");
                let event = ProcessingEvent::commit(key, message.offset, true, None);
                self.send_monitoring_event(event);
                Ok(())
            }
            Err(e) => {
                self.send_monitoring_event(ProcessingEvent::commit(
                    key,
                    message.offset,
                    false,
                    Some(e.to_string()),
                ));
                Err(ConsumerError::CommitFailed(e.to_string()))
            }
        }
    }
}

/// Builder for [`Consumer`]
///
/// ```no_run
/// # use partitioned_consumer::{Consumer, ConsumerConfig};
/// # async fn example(
/// #     handler: impl partitioned_consumer::Handler + 'static,
/// #     broker: impl partitioned_consumer::BrokerConsumer + 'static,
/// #     producer: impl partitioned_consumer::BrokerProducer + 'static,
/// # ) -> partitioned_consumer::Result<()> {
/// let config = ConsumerConfig::new(["usage-events"], "usage-events-dlq");
/// let (consumer, _monitoring_rx) = Consumer::builder(config)
///     .handler(handler)
///     .broker_consumer(broker)
///     .producer(producer)
///     .build()
///     .await?;
///
/// let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let result = consumer.run(shutdown_rx).await;
/// consumer.close().await?;
/// # let _ = result;
/// # Ok(())
/// # }
/// ```
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    handler: Option<Arc<dyn Handler>>,
    broker: Option<Arc<dyn BrokerConsumer>>,
    producer: Option<Arc<dyn BrokerProducer>>,
}

impl ConsumerBuilder {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            handler: None,
            broker: None,
            producer: None,
        }
    }

    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn broker_consumer(mut self, broker: impl BrokerConsumer + 'static) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Producer used for dead-letter delivery
    pub fn producer(mut self, producer: impl BrokerProducer + 'static) -> Self {
        self.producer = Some(Arc::new(producer));
        self
    }

    /// Validate, subscribe, and return the consumer with its monitoring receiver
    ///
    /// Nothing is subscribed or spawned if validation fails.
    pub async fn build(self) -> Result<(Consumer, Option<mpsc::Receiver<ProcessingEvent>>)> {
        let handler = self
            .handler
            .ok_or_else(|| ConsumerError::ConfigError("a message handler is required".into()))?;
        let broker = self
            .broker
            .ok_or_else(|| ConsumerError::ConfigError("a broker consumer is required".into()))?;
        let producer = self.producer.ok_or_else(|| {
            ConsumerError::ConfigError("a dead-letter producer is required".into())
        })?;

        let mut config = self.config;
        config.validate()?;
        config.topics = config.unique_topics();

        instruments::describe_metrics();

        broker.subscribe(&config.topics).await?;
        info!(topics = ?config.topics, dlq_topic = %config.dlq.topic, "Subscribed to topics");

        let (monitoring_tx, monitoring_rx) = if config.monitoring.enabled {
            let (tx, rx) = mpsc::channel(config.monitoring.channel_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let ctx = Arc::new(ProcessingContext::new(
            handler,
            broker,
            producer,
            config,
            monitoring_tx,
        ));

        Ok((Consumer::new(ctx), monitoring_rx))
    }
}

/// Partitioned consumer
pub struct Consumer {
    ctx: Arc<ProcessingContext>,
    is_running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    poll_active: Arc<watch::Sender<bool>>,
    partitions: Arc<RwLock<Vec<PartitionKey>>>,
}

impl Consumer {
    pub fn builder(config: ConsumerConfig) -> ConsumerBuilder {
        ConsumerBuilder::new(config)
    }

    fn new(ctx: Arc<ProcessingContext>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (poll_active, _) = watch::channel(false);
        Self {
            ctx,
            is_running: AtomicBool::new(false),
            stop_tx,
            poll_active: Arc::new(poll_active),
            partitions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.ctx.config
    }

    /// Partitions that currently have a worker, in sorted order
    pub fn active_partitions(&self) -> Vec<PartitionKey> {
        self.partitions.read().clone()
    }

    /// Run the poll loop until shutdown, close, or a fatal broker error
    ///
    /// Always returns an error describing why consumption stopped:
    /// [`ConsumerError::Shutdown`] when `shutdown` fires or its sender is
    /// dropped, [`ConsumerError::Closed`] when [`Consumer::close`] ended the
    /// loop, and [`ConsumerError::Fatal`] for an unrecoverable broker error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.ctx.is_closing() {
            return Err(ConsumerError::Closed);
        }
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConsumerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.is_running);

        self.stop_tx.send_replace(false);
        // close() may have raced the reset above
        if self.ctx.is_closing() {
            return Err(ConsumerError::Closed);
        }

        self.poll_active.send_replace(true);
        let poll_loop = PollLoop {
            ctx: self.ctx.clone(),
            workers: HashMap::new(),
            stop_rx: self.stop_tx.subscribe(),
            partitions: self.partitions.clone(),
        };
        let handle = tokio::spawn(poll_loop.run(ActiveGuard(self.poll_active.clone())));

        info!(topics = ?self.ctx.config.topics, "Consumer running");

        let mut active_rx = self.poll_active.subscribe();
        let shutdown_requested = tokio::select! {
            _ = signalled(&mut shutdown) => true,
            _ = poll_stopped(&mut active_rx) => false,
        };

        if shutdown_requested {
            info!("Shutdown signal received, stopping consumer");
            self.stop_tx.send_replace(true);
        }

        match handle.await? {
            Ok(()) if shutdown_requested => Err(ConsumerError::Shutdown),
            Ok(()) => Err(ConsumerError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Stop the poll loop and its workers, then close the broker session
    ///
    /// Idempotent: only the first call has any effect.
    pub async fn close(&self) -> Result<()> {
        if self
            .ctx
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Consumer already closed");
            return Ok(());
        }

        info!("Closing consumer");
        self.stop_tx.send_replace(true);

        poll_stopped(&mut self.poll_active.subscribe()).await;

        self.ctx.broker.close().await?;
        info!("Consumer closed");
        Ok(())
    }

    /// Publish `message` to the dead-letter topic with `error` attached
    ///
    /// A no-op once the consumer is closing.
    pub async fn send_to_dlq(&self, message: &Message, error: &str) -> Result<()> {
        self.ctx.send_to_dlq(message, error).await
    }

    pub async fn commit_message(&self, message: &Message) -> Result<()> {
        self.ctx.commit_message(message).await
    }
}

async fn poll_stopped(active_rx: &mut watch::Receiver<bool>) {
    let _ = active_rx.wait_for(|active| !*active).await;
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Clears the poll-active flag however the poll task ends
struct ActiveGuard(Arc<watch::Sender<bool>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

struct PollLoop {
    ctx: Arc<ProcessingContext>,
    workers: HashMap<PartitionKey, PartitionWorker>,
    stop_rx: watch::Receiver<bool>,
    partitions: Arc<RwLock<Vec<PartitionKey>>>,
}

impl PollLoop {
    async fn run(mut self, _active: ActiveGuard) -> Result<()> {
        debug!("Poll loop started");
        let poll_timeout = self.ctx.config.poll_timeout;

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = signalled(&mut self.stop_rx) => break Ok(()),
                event = self.ctx.broker.poll(poll_timeout) => event,
            };

            if let Some(event) = event {
                if let Err(e) = self.dispatch(event).await {
                    break Err(e);
                }
            }
        };

        let keys: Vec<PartitionKey> = self.workers.keys().cloned().collect();
        self.stop_workers(&keys).await;
        debug!("Poll loop stopped");
        result
    }

    async fn dispatch(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::Message(message) => {
                self.route_message(message).await;
                Ok(())
            }
            BrokerEvent::PartitionsAssigned(partitions) => self.on_assigned(partitions).await,
            BrokerEvent::PartitionsRevoked(partitions) => self.on_revoked(partitions).await,
            BrokerEvent::Error(e) => self.on_error(e),
            BrokerEvent::OffsetsCommitted { offsets, error } => {
                match error {
                    Some(e) => {
                        warn!(count = offsets.len(), error = %e, "Offset commit reported an error")
                    }
                    None => debug!(count = offsets.len(), "Offsets committed"),
                }
                Ok(())
            }
        }
    }

    async fn route_message(&mut self, message: Message) {
        let key = PartitionKey::from(&message);
        let Some(worker) = self.workers.get(&key) else {
            warn!(
                partition = %key,
                offset = message.offset,
                "No worker for partition, dropping message"
            );
            self.ctx.send_monitoring_event(ProcessingEvent::message_dropped(
                key,
                message.offset,
                "no worker for partition",
            ));
            return;
        };

        match worker.enqueue(message, &mut self.stop_rx).await {
            Ok(()) => {}
            Err(EnqueueError::Cancelled(message)) => {
                debug!(
                    partition = %key,
                    offset = message.offset,
                    "Enqueue cancelled by shutdown, message will be redelivered"
                );
            }
            Err(e) => {
                let message = e.into_message();
                warn!(
                    partition = %key,
                    offset = message.offset,
                    "Worker no longer accepting messages, dropping"
                );
                self.ctx.send_monitoring_event(ProcessingEvent::message_dropped(
                    key,
                    message.offset,
                    "worker stopping",
                ));
            }
        }
    }

    async fn on_assigned(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        let partitions: Vec<TopicPartition> = partitions
            .into_iter()
            .map(|tp| tp.with_offset(Offset::Stored))
            .collect();
        info!(count = partitions.len(), "Partitions assigned");

        if let Err(e) = self.ctx.broker.incremental_assign(&partitions).await {
            error!(error = %e, "Failed to apply partition assignment, no workers started");
            return if e.fatal {
                Err(ConsumerError::Fatal(e))
            } else {
                Ok(())
            };
        }

        for tp in &partitions {
            let key = PartitionKey::from(tp);
            if self.workers.contains_key(&key) {
                debug!(partition = %key, "Worker already running");
                continue;
            }

            let worker = PartitionWorker::spawn(key.clone(), self.ctx.clone());
            self.workers.insert(key.clone(), worker);
            self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
                key,
                PartitionEventType::Assigned,
                None,
            ));
        }

        self.publish_partitions();
        Ok(())
    }

    async fn on_revoked(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        let lost = self.ctx.broker.assignment_lost();
        if lost {
            warn!(
                count = partitions.len(),
                "Partitions lost involuntarily, commits for in-flight messages may fail"
            );
        } else {
            info!(count = partitions.len(), "Partitions revoked");
        }

        let event_type = if lost {
            PartitionEventType::Lost
        } else {
            PartitionEventType::Revoked
        };
        let keys: Vec<PartitionKey> = partitions.iter().map(PartitionKey::from).collect();
        for key in &keys {
            self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
                key.clone(),
                event_type,
                None,
            ));
        }

        self.stop_workers(&keys).await;

        if let Err(e) = self.ctx.broker.incremental_unassign(&partitions).await {
            error!(error = %e, "Failed to release revoked partitions");
            if e.fatal {
                return Err(ConsumerError::Fatal(e));
            }
        }
        Ok(())
    }

    fn on_error(&self, e: BrokerError) -> Result<()> {
        if e.is_local() {
            warn!(error = %e, "Local broker client error");
        } else {
            error!(error = %e, "Broker error");
        }

        if e.fatal {
            error!(error = %e, "Fatal broker error, stopping consumer");
            return Err(ConsumerError::Fatal(e));
        }
        Ok(())
    }

    /// Stop the given workers, sharing one wait budget across all of them
    ///
    /// Workers still running when the budget runs out are force-stopped.
    async fn stop_workers(&mut self, keys: &[PartitionKey]) {
        let stopping: Vec<PartitionWorker> = keys
            .iter()
            .filter_map(|key| self.workers.remove(key))
            .collect();
        self.publish_partitions();

        if stopping.is_empty() {
            return;
        }

        for worker in &stopping {
            worker.shutdown();
        }

        let wait = self.ctx.config.stop_wait_timeout;
        // A wait too long to express as an instant never expires
        let deadline = Instant::now().checked_add(wait);
        info!(count = stopping.len(), wait_ms = ?wait.as_millis(), "Stopping partition workers");

        for worker in stopping {
            let key = worker.key().clone();
            let stopped = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, worker.wait_done()).await,
                None => {
                    worker.wait_done().await;
                    Ok(())
                }
            };
            match stopped {
                Ok(()) => {
                    debug!(partition = %key, "Partition worker stopped");
                    self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
                        key,
                        PartitionEventType::Stopped,
                        None,
                    ));
                }
                Err(_) => {
                    warn!(
                        partition = %key,
                        wait_ms = ?wait.as_millis(),
                        "Partition worker did not stop in time, force-stopping"
                    );
                    worker.force_stop();
                    self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
                        key,
                        PartitionEventType::ForceStopped,
                        Some(format!("exceeded stop wait of {wait:?}")),
                    ));
                }
            }
        }
    }

    fn publish_partitions(&self) {
        let mut keys: Vec<PartitionKey> = self.workers.keys().cloned().collect();
        keys.sort();
        *self.partitions.write() = keys;
    }
}
