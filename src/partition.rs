use std::fmt;

use crate::client::{Message, TopicPartition};

/// Identifies one partition of one topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    topic: String,
    partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Whether `message` belongs to this partition
    pub fn owns(&self, message: &Message) -> bool {
        self.partition == message.partition && self.topic == message.topic
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

impl From<&Message> for PartitionKey {
    fn from(message: &Message) -> Self {
        Self::new(message.topic.clone(), message.partition)
    }
}

impl From<&TopicPartition> for PartitionKey {
    fn from(tp: &TopicPartition) -> Self {
        Self::new(tp.topic.clone(), tp.partition)
    }
}
