// tests/common/mod.rs
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use partitioned_consumer::test::mocks::{MockBrokerConsumer, MockHandler, MockProducer};
use partitioned_consumer::{Consumer, ConsumerConfig, ConsumerError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

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
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    });
}

pub fn create_test_config() -> ConsumerConfig {
    let mut config = ConsumerConfig::new(["usage-events"], "usage-events-dlq");
    config.poll_timeout = Duration::from_millis(10);
    config.processing_timeout = Some(Duration::from_secs(2));
    config.stop_wait_timeout = Duration::from_secs(1);
    config.dlq.delivery_timeout = Duration::from_millis(500);
    config.retry.max_retries = 2;
    config.retry.initial_backoff = Duration::from_millis(5);
    config.retry.max_backoff = Duration::from_millis(20);
    config
}

pub struct TestContext {
    pub consumer: Arc<Consumer>,
    pub broker: MockBrokerConsumer,
    pub producer: MockProducer,
    pub handler: MockHandler,
    shutdown_tx: watch::Sender<bool>,
    run_handle: Option<JoinHandle<Result<(), ConsumerError>>>,
}

impl TestContext {
    pub async fn new(config: ConsumerConfig, handler: MockHandler) -> Result<Self> {
        init_logging();
        let broker = MockBrokerConsumer::new();
        let producer = MockProducer::new();
        let (consumer, _monitoring_rx) = Consumer::builder(config)
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
            shutdown_tx,
            run_handle: None,
        })
    }

    pub fn start(&mut self) {
        let consumer = self.consumer.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.run_handle = Some(tokio::spawn(async move { consumer.run(shutdown_rx).await }));
    }

    /// Signal shutdown and wait for the run loop to return
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Result<(), ConsumerError>> {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .run_handle
            .take()
            .ok_or_else(|| anyhow::anyhow!("consumer was not started"))?;
        Ok(tokio::time::timeout(timeout, handle).await??)
    }
}
