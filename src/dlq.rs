//! Dead-letter record construction
//!
//! The dead-letter record carries the original payload and key verbatim. Each
//! original header is re-emitted as `original_<key>`, followed by the source
//! coordinates and the processing error.

use bytes::Bytes;

use crate::client::{Header, Message, ProducerRecord};

pub const ORIGINAL_HEADER_PREFIX: &str = "original_";
pub const ORIGINAL_TOPIC_HEADER: &str = "original_topic";
pub const ORIGINAL_PARTITION_HEADER: &str = "original_partition";
pub const ORIGINAL_OFFSET_HEADER: &str = "original_offset";
pub const ERROR_HEADER: &str = "error";

/// Build the record published to `dlq_topic` for a message that could not be processed
pub fn build_dead_letter(dlq_topic: &str, message: &Message, error: &str) -> ProducerRecord {
    let mut headers: Vec<Header> = message
        .headers
        .iter()
        .map(|h| Header::new(format!("{ORIGINAL_HEADER_PREFIX}{}", h.key), h.value.clone()))
        .collect();

    headers.push(Header::new(ORIGINAL_TOPIC_HEADER, message.topic.clone()));
    headers.push(Header::new(
        ORIGINAL_PARTITION_HEADER,
        message.partition.to_string(),
    ));
    headers.push(Header::new(ORIGINAL_OFFSET_HEADER, message.offset.to_string()));
    headers.push(Header::new(ERROR_HEADER, Bytes::copy_from_slice(error.as_bytes())));

    ProducerRecord {
        topic: dlq_topic.to_string(),
        key: message.key.clone(),
        payload: message.payload.clone(),
        headers,
    }
}
