//! Partition worker - dedicated task for processing messages from a single partition
//!
//! Each assigned partition gets its own worker with a bounded intake channel:
//! 1. Ordering is preserved within the partition (one message at a time)
//! 2. Partitions are processed in parallel with each other
//! 3. Backpressure is applied to the poll loop when processing falls behind
//!
//! The intake channel is the only state shared with the coordinator. Stopping
//! is signalled through watch channels, never through shared fields.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::Message;
use crate::consumer::ProcessingContext;
use crate::error::{ConsumerError, EnqueueError, ProcessingError};
use crate::monitoring::instruments;
use crate::monitoring::ProcessingEvent;
use crate::partition::PartitionKey;
use crate::retry::{RetryError, RetryHandle};

/// Header carrying a producer-assigned message identifier
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Lifecycle of a partition worker. A worker never restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Cooperative stop requested, the current message may still finish
    ShuttingDown,
    /// Intake closed, the loop exits without finishing the current message
    ForceStopped,
    Done,
}

/// Handle to the task processing one partition
pub struct PartitionWorker {
    key: PartitionKey,
    ctx: Arc<ProcessingContext>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    shutdown_tx: watch::Sender<bool>,
    force_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PartitionWorker {
    /// Start the worker task for `key`
    pub(crate) fn spawn(key: PartitionKey, ctx: Arc<ProcessingContext>) -> Self {
        let (sender, intake) = mpsc::channel(ctx.config.channel_buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (force_tx, force_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let task = WorkerTask {
            key: key.clone(),
            ctx: ctx.clone(),
            intake,
            shutdown_rx,
            force_rx,
        };
        tokio::spawn(task.run(DoneGuard(done_tx)));

        Self {
            key,
            ctx,
            sender: Mutex::new(Some(sender)),
            shutdown_tx,
            force_tx,
            done_rx,
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Hand a message to this worker
    ///
    /// Tries a non-blocking send first. When the intake is full this waits for
    /// capacity until `cancel` is set; the message is never dropped to relieve
    /// pressure and is handed back on any failure.
    pub async fn enqueue(
        &self,
        message: Message,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), EnqueueError> {
        if self.is_shutting_down() {
            return Err(EnqueueError::ShuttingDown(message));
        }

        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(EnqueueError::Closed(message));
        };

        let message = match sender.try_send(message) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(message)) => return Err(EnqueueError::Closed(message)),
            Err(TrySendError::Full(message)) => message,
        };

        warn!(
            partition = %self.key,
            offset = message.offset,
            capacity = self.ctx.config.channel_buffer_size,
            "Partition intake full, applying backpressure"
        );
        self.ctx
            .send_monitoring_event(ProcessingEvent::backpressure(self.key.clone(), message.offset));

        tokio::select! {
            permit = sender.reserve() => match permit {
                Ok(permit) => {
                    permit.send(message);
                    Ok(())
                }
                Err(_) => Err(EnqueueError::Closed(message)),
            },
            _ = signalled(cancel) => Err(EnqueueError::Cancelled(message)),
        }
    }

    /// Request a cooperative stop
    ///
    /// No further messages are accepted. A message already being handled is
    /// allowed to finish or time out on its own.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Close the intake and stop the loop immediately
    ///
    /// A message that is mid-processing is abandoned without a commit, so the
    /// next owner of the partition receives it again. Safe to call repeatedly.
    pub fn force_stop(&self) {
        drop(self.sender.lock().take());
        self.force_tx.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolves once the worker task has exited
    pub async fn wait_done(&self) {
        let mut done_rx = self.done_rx.clone();
        // An error means the task is gone, which is also done
        let _ = done_rx.wait_for(|done| *done).await;
    }

    pub fn state(&self) -> WorkerState {
        if self.is_done() {
            WorkerState::Done
        } else if *self.force_tx.borrow() {
            WorkerState::ForceStopped
        } else if *self.shutdown_tx.borrow() {
            WorkerState::ShuttingDown
        } else {
            WorkerState::Running
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow() || *self.force_tx.borrow()
    }
}

/// Resolves once the flag is set or its sender is gone
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Marks the worker done however its task ends
struct DoneGuard(watch::Sender<bool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Why a message did not reach a successful outcome
enum Failure {
    Retry(RetryError),
    TimedOut(Duration),
}

impl Failure {
    /// Text recorded in the dead-letter `error` header
    fn error_text(&self) -> String {
        match self {
            Failure::Retry(e) => e.last_error().map_or_else(|| e.to_string(), str::to_string),
            Failure::TimedOut(limit) => ConsumerError::ProcessingTimeout(*limit).to_string(),
        }
    }
}

struct WorkerTask {
    key: PartitionKey,
    ctx: Arc<ProcessingContext>,
    intake: mpsc::Receiver<Message>,
    shutdown_rx: watch::Receiver<bool>,
    force_rx: watch::Receiver<bool>,
}

impl WorkerTask {
    async fn run(mut self, _done: DoneGuard) {
        info!(partition = %self.key, "Starting partition worker");

        loop {
            let received = tokio::select! {
                biased;
                _ = signalled(&mut self.force_rx) => {
                    debug!(partition = %self.key, "Force-stop received");
                    break;
                }
                _ = signalled(&mut self.shutdown_rx) => {
                    debug!(partition = %self.key, "Shutdown signal received");
                    break;
                }
                received = self.intake.recv() => received,
            };

            let Some(message) = received else {
                if *self.force_rx.borrow() || *self.shutdown_rx.borrow() {
                    debug!(partition = %self.key, "Intake closed during shutdown");
                } else {
                    error!(partition = %self.key, "Intake channel closed unexpectedly");
                }
                break;
            };

            if !self.key.owns(&message) {
                error!(
                    partition = %self.key,
                    message_topic = %message.topic,
                    message_partition = message.partition,
                    offset = message.offset,
                    "Message routed to the wrong partition worker, dropping"
                );
                self.ctx.send_monitoring_event(ProcessingEvent::message_dropped(
                    self.key.clone(),
                    message.offset,
                    "cross-routed",
                ));
                continue;
            }

            let offset = message.offset;
            let mut force_rx = self.force_rx.clone();
            tokio::select! {
                biased;
                _ = signalled(&mut force_rx) => {
                    warn!(
                        partition = %self.key,
                        offset = offset,
                        "Worker force-stopped mid-message, offset left uncommitted"
                    );
                    break;
                }
                _ = self.handle_message(message) => {}
            }
        }

        info!(partition = %self.key, "Partition worker stopped");
    }

    /// Process one message to a terminal outcome, then commit it
    async fn handle_message(&self, message: Message) {
        let event_name = self.ctx.event_name(&message);
        let span = info_span!(
            "consumer.process_message",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            event_type = %event_name,
        );

        async move {
            let started = Instant::now();
            let attempts = AtomicU32::new(0);

            let outcome = match self.ctx.config.processing_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.process_with_retry(&message, &attempts))
                        .await
                    {
                        Ok(result) => result.map_err(Failure::Retry),
                        Err(_) => Err(Failure::TimedOut(limit)),
                    }
                }
                None => self
                    .process_with_retry(&message, &attempts)
                    .await
                    .map_err(Failure::Retry),
            };

            if let Err(Failure::Retry(RetryError::Interrupted)) = outcome {
                warn!(
                    partition = %self.key,
                    offset = message.offset,
                    "Retries interrupted by shutdown, leaving message for the next owner"
                );
                return;
            }

            let elapsed = started.elapsed();
            let success = outcome.is_ok();
            instruments::record_processing(&event_name, success, elapsed);
            self.ctx.send_monitoring_event(ProcessingEvent::message_processed(
                self.key.clone(),
                message.offset,
                event_name.clone(),
                success,
                attempts.load(Ordering::SeqCst),
                elapsed,
                outcome.as_ref().err().map(Failure::error_text),
            ));

            if let Err(failure) = outcome {
                let error_text = failure.error_text();
                error!(
                    partition = %self.key,
                    offset = message.offset,
                    event_name = %event_name,
                    age_ms = ?message.age().map(|age| age.as_millis()),
                    error = %error_text,
                    "Message processing failed, sending to dead-letter topic"
                );

                if let Err(e) = self.ctx.send_to_dlq(&message, &error_text).await {
                    error!(
                        partition = %self.key,
                        offset = message.offset,
                        error = %e,
                        "Dead-letter delivery failed, committing offset anyway"
                    );
                }
            } else {
                debug!(
                    partition = %self.key,
                    offset = message.offset,
                    elapsed_ms = ?elapsed.as_millis(),
                    age_ms = ?message.age().map(|age| age.as_millis()),
                    "Message processed"
                );
            }

            if let Err(e) = self.ctx.commit_message(&message).await {
                error!(
                    partition = %self.key,
                    offset = message.offset,
                    error = %e,
                    "Failed to commit offset"
                );
            }
        }
        .instrument(span)
        .await
    }

    async fn process_with_retry(
        &self,
        message: &Message,
        attempts: &AtomicU32,
    ) -> Result<(), RetryError> {
        let config = &self.ctx.config.retry;
        let mut retry = RetryHandle::new(config.clone(), config.backoff());
        let mut shutdown_rx = self.shutdown_rx.clone();

        retry
            .retry(
                |attempt| {
                    attempts.store(attempt, Ordering::SeqCst);
                    self.process_message(message)
                },
                &mut shutdown_rx,
            )
            .await
    }

    /// Invoke the handler, converting a panic into a failed attempt
    async fn process_message(&self, message: &Message) -> Result<(), ProcessingError> {
        match AssertUnwindSafe(self.ctx.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let details = panic_details(payload.as_ref());
                let message_id = message_identity(message);
                error!(
                    partition = %self.key,
                    offset = message.offset,
                    message_id = %message_id,
                    panic = %details,
                    "Handler panicked, treating as failed attempt"
                );
                self.ctx.send_monitoring_event(ProcessingEvent::panic_recovered(
                    self.key.clone(),
                    message.offset,
                    message_id,
                    details.clone(),
                ));
                Err(ProcessingError::Panicked(details))
            }
        }
    }
}

/// Best-effort identity for log lines about `message`
fn message_identity(message: &Message) -> String {
    message
        .header(MESSAGE_ID_HEADER)
        .and_then(|id| std::str::from_utf8(id).ok())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!("{}-{}-{}", message.topic, message.partition, message.offset)
        })
}

fn panic_details(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
