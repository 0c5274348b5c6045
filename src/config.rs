//! Configuration for the consumer actor and the partitioned source.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::message::TopicPartition;
use crate::Result;

/// Default grace window between a revoke notification and the forced shutdown
/// of the affected substreams.
pub const DEFAULT_WAIT_CLOSE_PARTITION: Duration = Duration::from_millis(500);

/// Represents the authentication method used to connect to Kafka.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaAuth {
    Sasl {
        mechanism: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Settings for constructing the Kafka consumer actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The consumer group to join.
    pub consumer_group: String,
    /// The authentication mechanism to use for the Kafka consumer.
    pub auth: Option<KafkaAuth>,
    /// The TLS configuration for the Kafka consumer.
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

impl ConsumerSettings {
    pub fn new(brokers: Vec<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            brokers,
            consumer_group: consumer_group.into(),
            auth: None,
            tls: None,
            kafka_raw_config: HashMap::new(),
        }
    }
}

/// What the consumer actor subscribes to on startup.
#[derive(Debug, Clone, PartialEq)]
pub enum Subscription {
    /// An explicit set of topics.
    Topics(Vec<String>),
    /// Every topic matching a librdkafka regex. The pattern must start
    /// with `^`.
    Pattern(String),
}

pub type OffsetsFuture = Pin<Box<dyn Future<Output = Result<HashMap<TopicPartition, i64>>> + Send>>;

/// Chooses a starting offset per partition at assignment time. Partitions are
/// admitted only after the consumer has been repositioned to the returned
/// offsets.
pub type OffsetsOnAssign = Arc<dyn Fn(BTreeSet<TopicPartition>) -> OffsetsFuture + Send + Sync>;

/// User hook invoked with the cumulative revoked set when the grace window
/// expires.
pub type OnRevoke = Arc<dyn Fn(&BTreeSet<TopicPartition>) + Send + Sync>;

/// Settings for the partitioned source itself.
#[derive(Clone)]
pub struct MuxSettings {
    pub subscription: Subscription,
    /// Grace window before substreams of revoked partitions are forcibly
    /// closed. Gives in-flight requests and downstream consumers a bounded
    /// window to drain during rebalance storms.
    pub wait_close_partition: Duration,
    pub offsets_on_assign: Option<OffsetsOnAssign>,
    pub on_revoke: Option<OnRevoke>,
}

impl MuxSettings {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            wait_close_partition: DEFAULT_WAIT_CLOSE_PARTITION,
            offsets_on_assign: None,
            on_revoke: None,
        }
    }

    pub fn with_wait_close_partition(mut self, wait: Duration) -> Self {
        self.wait_close_partition = wait;
        self
    }

    pub fn with_offsets_on_assign(mut self, hook: OffsetsOnAssign) -> Self {
        self.offsets_on_assign = Some(hook);
        self
    }

    pub fn with_on_revoke(mut self, hook: OnRevoke) -> Self {
        self.on_revoke = Some(hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_settings_defaults() {
        let settings = MuxSettings::new(Subscription::Topics(vec!["orders".to_string()]));
        assert_eq!(settings.wait_close_partition, DEFAULT_WAIT_CLOSE_PARTITION);
        assert!(settings.offsets_on_assign.is_none());
        assert!(settings.on_revoke.is_none());
    }
}
