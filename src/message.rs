//! Record types flowing from the consumer actor to the per-partition
//! sub-streams, and the transformation capability applied before records are
//! handed to downstream consumers.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use bytes::Bytes;

/// A Kafka `(topic, partition-id)` identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A single record as polled from Kafka.
#[derive(Debug, Clone)]
pub struct KafkaRecord {
    /// The topic name.
    pub topic: String,
    /// The partition number.
    pub partition: i32,
    /// The offset of the record within its partition.
    pub offset: i64,
    /// Key of the record, when present and valid UTF-8.
    pub key: Option<String>,
    /// The user payload.
    pub value: Bytes,
    /// The headers of the record.
    pub headers: HashMap<String, String>,
    /// The timestamp of the record in milliseconds since epoch.
    /// None if the timestamp is not available.
    pub timestamp: Option<i64>,
}

impl KafkaRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(&self.topic, self.partition)
    }
}

/// Reply to a message request. The `tag` echoes the request tag; `records`
/// preserve per-partition order and support O(1) pop-front/append so substream
/// buffers can be concatenated without reallocation.
#[derive(Debug, Default)]
pub struct Messages {
    pub tag: u32,
    pub records: VecDeque<KafkaRecord>,
}

/// Transformation applied to every record before it is pushed downstream.
///
/// Must be pure; it is invoked on the substream task, one record at a time.
pub trait MessageBuilder: Send + Sync + 'static {
    type Msg: Send + 'static;

    fn create_message(&self, record: KafkaRecord) -> Self::Msg;
}

impl<F, M> MessageBuilder for F
where
    F: Fn(KafkaRecord) -> M + Send + Sync + 'static,
    M: Send + 'static,
{
    type Msg = M;

    fn create_message(&self, record: KafkaRecord) -> M {
        self(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_partition_display_and_ordering() {
        let a = TopicPartition::new("orders", 0);
        let b = TopicPartition::new("orders", 1);
        assert_eq!(a.to_string(), "orders-0");
        assert!(a < b);
    }

    #[test]
    fn closures_are_message_builders() {
        let builder = |record: KafkaRecord| record.offset * 2;
        let record = KafkaRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 21,
            key: None,
            value: Bytes::new(),
            headers: HashMap::new(),
            timestamp: None,
        };
        assert_eq!(builder.create_message(record), 42);
    }
}
