//! Partitioned Kafka consumer multiplexer.
//!
//! A single Kafka consumer actor feeds a stream-of-streams: the
//! [`mux::PartitionedSource`] produces one `(TopicPartition, SubSource)` pair
//! for every partition the broker assigns, and each [`sub_source::SubSource`]
//! yields the records polled for exactly that partition until the partition is
//! revoked or downstream cancels. Rebalance notifications drive partition
//! ownership transfers; revoked partitions get a grace window so in-flight
//! requests can drain before their substreams are forcibly closed.

pub mod config;
pub mod consumer;
pub mod message;
pub mod mux;
pub mod sub_source;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConsumerSettings, KafkaAuth, MuxSettings, Subscription, TlsConfig};
pub use consumer::{ConsumerHandle, RebalanceEvent, RebalanceListener};
pub use message::{KafkaRecord, MessageBuilder, Messages, TopicPartition};
pub use mux::{PartitionedSource, PartitionedStream, SourceControl};
pub use sub_source::{SubSource, SubSourceControl};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Kafka consumer failed - {0}")]
    ConsumerFailed(String),

    #[error("Seek failed for partitions {partitions:?} - {reason}")]
    SeekFailed {
        partitions: Vec<TopicPartition>,
        reason: String,
    },

    #[error("Consumer actor task terminated - {0}")]
    ActorTaskTerminated(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for every failure rooted in the consumer actor, including seek
    /// failures and a torn-down actor task.
    pub fn is_consumer_failure(&self) -> bool {
        matches!(
            self,
            Error::ConsumerFailed(_) | Error::SeekFailed { .. } | Error::ActorTaskTerminated(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_failure_classification() {
        assert!(Error::ConsumerFailed("gone".to_string()).is_consumer_failure());
        assert!(Error::SeekFailed {
            partitions: vec![TopicPartition::new("orders", 0)],
            reason: "timed out".to_string(),
        }
        .is_consumer_failure());
        assert!(!Error::Kafka("subscribe".to_string()).is_consumer_failure());
    }
}
