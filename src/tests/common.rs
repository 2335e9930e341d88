use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ConsumerConfig;
use crate::monitoring::{ProcessingEvent, ProcessingEventType};
use crate::test::mocks::{MockBrokerConsumer, MockHandler, MockProducer};
use crate::{Consumer, Result};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("partitioned_consumer=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

/// A consumer wired to mocks, with its run loop on a background task
pub struct TestContext {
    pub consumer: Arc<Consumer>,
    pub broker: MockBrokerConsumer,
    pub producer: MockProducer,
    pub handler: MockHandler,
    pub monitoring_rx: Option<mpsc::Receiver<ProcessingEvent>>,
    shutdown_tx: watch::Sender<bool>,
    run_handle: Option<JoinHandle<Result<()>>>,
}

impl TestContext {
    pub async fn new(mut config: ConsumerConfig, handler: MockHandler) -> anyhow::Result<Self> {
        init_logging();
        config.monitoring.enabled = true;

        let broker = MockBrokerConsumer::new();
        let producer = MockProducer::new();
        let (consumer, monitoring_rx) = Consumer::builder(config)
            .handler(handler.clone())
            .broker_consumer(broker.clone())
            .producer(producer.clone())
            .build()
            .await?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            consumer: Arc::new(consumer),
            broker,
            producer,
            handler,
            monitoring_rx,
            shutdown_tx,
            run_handle: None,
        })
    }

    pub fn start(&mut self) {
        let consumer = self.consumer.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.run_handle = Some(tokio::spawn(async move { consumer.run(shutdown_rx).await }));
    }

    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for the run loop to return
    pub async fn join(&mut self, timeout: Duration) -> anyhow::Result<Result<()>> {
        let handle = self
            .run_handle
            .take()
            .ok_or_else(|| anyhow::anyhow!("consumer was not started"))?;
        Ok(tokio::time::timeout(timeout, handle).await??)
    }

    /// Drain monitoring events received so far
    pub fn drain_events(&mut self) -> Vec<ProcessingEventType> {
        let mut events = Vec::new();
        if let Some(rx) = self.monitoring_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event.event_type);
            }
        }
        events
    }
}
