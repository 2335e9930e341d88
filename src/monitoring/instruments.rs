//! Metric instruments published through the `metrics` facade

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Duration;

/// Counter of messages reaching a terminal outcome, labelled by event type and status
pub const MESSAGE_PROCESSING_COUNT: &str = "consumer.message_processing_count";

/// Histogram of per-message processing time in milliseconds
pub const MESSAGE_PROCESSING_TIME_MS: &str = "consumer.message_processing_time_ms";

/// Counter of messages handed to the dead-letter topic
pub const DLQ_MESSAGE_COUNT: &str = "consumer.dlq_message_count";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// Label used when a handler cannot name the event
pub const UNKNOWN_EVENT: &str = "unknown";

/// Register descriptions for all consumer instruments
pub fn describe_metrics() {
    describe_counter!(
        MESSAGE_PROCESSING_COUNT,
        Unit::Count,
        "Messages processed, by event type and outcome"
    );
    describe_histogram!(
        MESSAGE_PROCESSING_TIME_MS,
        Unit::Milliseconds,
        "Time spent processing a message including retries"
    );
    describe_counter!(
        DLQ_MESSAGE_COUNT,
        Unit::Count,
        "Messages delivered to the dead-letter topic"
    );
}

pub fn record_processing(event_name: &str, success: bool, elapsed: Duration) {
    let status = if success { STATUS_SUCCESS } else { STATUS_FAILED };
    counter!(
        MESSAGE_PROCESSING_COUNT,
        "event_type" => event_name.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        MESSAGE_PROCESSING_TIME_MS,
        "event_type" => event_name.to_string(),
        "status" => status
    )
    .record(elapsed.as_secs_f64() * 1000.0);
}

pub fn record_dead_letter(event_name: &str) {
    counter!(DLQ_MESSAGE_COUNT, "event_type" => event_name.to_string()).increment(1);
}
