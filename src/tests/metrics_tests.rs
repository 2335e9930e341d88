use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::sync::OnceLock;
use std::time::Duration;

use crate::client::{BrokerError, BrokerEvent, Message};
use crate::monitoring::instruments::{
    DLQ_MESSAGE_COUNT, MESSAGE_PROCESSING_COUNT, MESSAGE_PROCESSING_TIME_MS, STATUS_FAILED,
    STATUS_SUCCESS,
};
use crate::test::mocks::{MockHandler, EVENT_NAME_HEADER};
use crate::test::{test_config, TestUtils};

use super::common::TestContext;

/// Debugging recorder installed once for the whole test binary
fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        drop(recorder.install());
        snapshotter
    })
}

struct Recorded(Vec<(String, Vec<(String, String)>, DebugValue)>);

impl Recorded {
    fn take(snapshotter: &Snapshotter) -> Self {
        let metrics = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let labels = key
                    .key()
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (key.key().name().to_string(), labels, value)
            })
            .collect();
        Self(metrics)
    }

    fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&DebugValue> {
        self.0
            .iter()
            .find(|(n, l, _)| {
                n == name
                    && l.len() == labels.len()
                    && labels
                        .iter()
                        .all(|(k, v)| l.iter().any(|(lk, lv)| lk == k && lv == v))
            })
            .map(|(_, _, value)| value)
    }

    fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.find(name, labels) {
            Some(DebugValue::Counter(count)) => *count,
            _ => 0,
        }
    }

    fn histogram_samples(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        match self.find(name, labels) {
            Some(DebugValue::Histogram(samples)) => samples.len(),
            _ => 0,
        }
    }
}

fn metered(offset: i64, event_name: &'static str) -> Message {
    TestUtils::create_test_message("usage", 0, offset).with_header(EVENT_NAME_HEADER, event_name)
}

#[tokio::test]
async fn test_instruments_record_outcomes_and_confirmed_dead_letters() -> anyhow::Result<()> {
    let snapshotter = snapshotter();
    let handler = MockHandler::new();
    handler.fail_hard(1, "unknown meter").await;
    handler.fail_hard(2, "unknown meter").await;
    let mut config = test_config(&["usage"]);
    config.dlq.delivery_timeout = Duration::from_millis(200);
    let mut ctx = TestContext::new(config, handler).await?;

    ctx.broker.push_event(TestUtils::assigned("usage", &[0])).await;
    ctx.broker
        .push_messages([metered(0, "meter.accepted"), metered(1, "meter.rejected")])
        .await;
    ctx.start();
    ctx.broker.wait_for_commits(2, Duration::from_secs(2)).await?;

    // Dead-letter delivery fails for the last message
    ctx.producer
        .fail_with(BrokerError::broker("dead-letter topic unavailable"))
        .await;
    ctx.broker
        .push_event(BrokerEvent::Message(metered(2, "meter.unroutable")))
        .await;
    ctx.broker.wait_for_commits(3, Duration::from_secs(2)).await?;
    ctx.signal_shutdown();
    ctx.join(Duration::from_secs(2)).await?.ok();

    let recorded = Recorded::take(snapshotter);
    let accepted = [("event_type", "meter.accepted"), ("status", STATUS_SUCCESS)];
    assert_eq!(recorded.counter(MESSAGE_PROCESSING_COUNT, &accepted), 1);
    assert_eq!(recorded.histogram_samples(MESSAGE_PROCESSING_TIME_MS, &accepted), 1);

    let rejected = [("event_type", "meter.rejected"), ("status", STATUS_FAILED)];
    assert_eq!(recorded.counter(MESSAGE_PROCESSING_COUNT, &rejected), 1);
    assert_eq!(recorded.histogram_samples(MESSAGE_PROCESSING_TIME_MS, &rejected), 1);
    assert_eq!(
        recorded.counter(DLQ_MESSAGE_COUNT, &[("event_type", "meter.rejected")]),
        1
    );

    let unroutable = [("event_type", "meter.unroutable"), ("status", STATUS_FAILED)];
    assert_eq!(recorded.counter(MESSAGE_PROCESSING_COUNT, &unroutable), 1);
    assert_eq!(
        recorded.counter(DLQ_MESSAGE_COUNT, &[("event_type", "meter.unroutable")]),
        0
    );

    assert_eq!(recorded.counter(DLQ_MESSAGE_COUNT, &[("event_type", "meter.accepted")]), 0);
    assert_eq!(ctx.producer.produced().await.len(), 1);
    Ok(())
}
