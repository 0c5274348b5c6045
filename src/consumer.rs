//! The Kafka consumer actor and its mailbox contract.
//!
//! The actor owns the only Kafka client in the system. The multiplexer sends
//! lifecycle commands (`Subscribe`, `SubscribePattern`, `Seek`, `Stop`); each
//! substream sends `RequestMessages` tagged with its partition and receives a
//! `Messages` reply once records for that partition have been polled. Rebalance
//! callbacks from librdkafka are forwarded through the [`RebalanceListener`]
//! registered at subscribe time. The actor terminates on `Stop`, when every
//! handle is dropped, or on a fatal poll failure; watchers observe termination
//! through [`ConsumerHandle::terminated`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerSettings, KafkaAuth, TlsConfig};
use crate::message::{KafkaRecord, Messages, TopicPartition};
use crate::{Error, Result};

/// The mailbox contract of the consumer actor.
pub enum ConsumerMessage {
    Subscribe {
        topics: Vec<String>,
        listener: RebalanceListener,
    },
    SubscribePattern {
        pattern: String,
        listener: RebalanceListener,
    },
    Seek {
        offsets: HashMap<TopicPartition, i64>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    RequestMessages {
        tag: u32,
        partitions: BTreeSet<TopicPartition>,
        respond_to: oneshot::Sender<Messages>,
    },
    Stop,
}

/// A rebalance notification as delivered by the broker.
#[derive(Debug)]
pub enum RebalanceEvent {
    Assigned(BTreeSet<TopicPartition>),
    Revoked(BTreeSet<TopicPartition>),
}

/// Forwards rebalance callbacks into the multiplexer. Registered with the
/// consumer actor as part of `Subscribe`/`SubscribePattern`.
#[derive(Clone)]
pub struct RebalanceListener {
    sender: mpsc::UnboundedSender<RebalanceEvent>,
}

impl RebalanceListener {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RebalanceEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn partitions_assigned(&self, partitions: BTreeSet<TopicPartition>) {
        let _ = self.sender.send(RebalanceEvent::Assigned(partitions));
    }

    pub fn partitions_revoked(&self, partitions: BTreeSet<TopicPartition>) {
        let _ = self.sender.send(RebalanceEvent::Revoked(partitions));
    }
}

/// Cloneable handle to the consumer actor.
///
/// The multiplexer is the sole lifecycle owner; substreams hold non-owning
/// clones and only ever send `RequestMessages`.
#[derive(Clone)]
pub struct ConsumerHandle {
    sender: mpsc::Sender<ConsumerMessage>,
    terminated: CancellationToken,
}

impl ConsumerHandle {
    /// Creates the handle and the mailbox an actor implementation drains.
    /// Dropping the mailbox marks the actor terminated for every watcher.
    pub fn channel(capacity: usize) -> (Self, ConsumerMailbox) {
        let (sender, receiver) = mpsc::channel(capacity);
        let terminated = CancellationToken::new();
        (
            Self {
                sender,
                terminated: terminated.clone(),
            },
            ConsumerMailbox {
                receiver,
                terminated,
            },
        )
    }

    pub async fn subscribe(&self, topics: Vec<String>, listener: RebalanceListener) {
        let _ = self
            .sender
            .send(ConsumerMessage::Subscribe { topics, listener })
            .await;
    }

    pub async fn subscribe_pattern(&self, pattern: String, listener: RebalanceListener) {
        let _ = self
            .sender
            .send(ConsumerMessage::SubscribePattern { pattern, listener })
            .await;
    }

    /// Repositions the consumer. The reply signals completion.
    pub async fn seek(&self, offsets: HashMap<TopicPartition, i64>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = ConsumerMessage::Seek {
            offsets,
            respond_to: tx,
        };
        // Ignore send errors. If send fails, so does the recv.await below.
        let _ = self.sender.send(msg).await;
        rx.await
            .map_err(|e| Error::ActorTaskTerminated(e.to_string()))?
    }

    /// Requests records for the given partitions. The reply arrives once the
    /// actor has polled records for at least one of them.
    pub async fn request_messages(
        &self,
        tag: u32,
        partitions: BTreeSet<TopicPartition>,
    ) -> Result<Messages> {
        let (tx, rx) = oneshot::channel();
        let msg = ConsumerMessage::RequestMessages {
            tag,
            partitions,
            respond_to: tx,
        };
        let _ = self.sender.send(msg).await;
        rx.await.map_err(|e| Error::ActorTaskTerminated(e.to_string()))
    }

    /// Fire-and-forget; the actor terminates when it processes the command.
    pub async fn stop(&self) {
        let _ = self.sender.send(ConsumerMessage::Stop).await;
    }

    /// Resolves once the actor has terminated, for whatever reason.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }
}

/// Receiving side of the actor mailbox.
pub struct ConsumerMailbox {
    receiver: mpsc::Receiver<ConsumerMessage>,
    terminated: CancellationToken,
}

impl ConsumerMailbox {
    pub async fn recv(&mut self) -> Option<ConsumerMessage> {
        self.receiver.recv().await
    }
}

impl Drop for ConsumerMailbox {
    fn drop(&mut self) {
        // The actor is gone once its mailbox is dropped, on every exit path.
        self.terminated.cancel();
    }
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka. Rebalance callbacks run on the polling
// thread and are forwarded to whichever listener was registered last.
struct KafkaContext {
    listener: Mutex<Option<RebalanceListener>>,
}

impl KafkaContext {
    fn new() -> Self {
        Self {
            listener: Mutex::new(None),
        }
    }

    fn set_listener(&self, listener: RebalanceListener) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }

    fn with_listener(&self, call: impl FnOnce(&RebalanceListener)) {
        if let Ok(slot) = self.listener.lock() {
            if let Some(listener) = slot.as_ref() {
                call(listener);
            }
        }
    }
}

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            info!(?partitions, "Rebalance: partitions revoked");
            self.with_listener(|listener| listener.partitions_revoked(partitions.clone()));
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            info!(?partitions, "Rebalance: partitions assigned");
            self.with_listener(|listener| listener.partitions_assigned(partitions.clone()));
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> BTreeSet<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

type MuxConsumer = StreamConsumer<KafkaContext>;

struct PendingRequest {
    tag: u32,
    partitions: BTreeSet<TopicPartition>,
    respond_to: oneshot::Sender<Messages>,
}

/// The rdkafka-backed consumer actor.
///
/// Polls the broker only while requests are outstanding, buffers polled
/// records per partition, and answers each pending request as soon as one of
/// its partitions has data.
pub struct KafkaConsumerActor {
    consumer: Arc<MuxConsumer>,
    mailbox: ConsumerMailbox,
    buffers: HashMap<TopicPartition, VecDeque<KafkaRecord>>,
    pending_requests: Vec<PendingRequest>,
}

impl KafkaConsumerActor {
    pub async fn start(settings: ConsumerSettings) -> Result<ConsumerHandle> {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false");
        if !settings.kafka_raw_config.is_empty() {
            info!(
                "Applying user-specified kafka config: {}",
                settings
                    .kafka_raw_config
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<String>>()
                    .join(", ")
            );
            for (key, value) in settings.kafka_raw_config {
                client_config.set(key, value);
            }
        }
        client_config
            .set("group.id", &settings.consumer_group)
            .set("bootstrap.servers", settings.brokers.join(","))
            .set_log_level(RDKafkaLogLevel::Warning);

        apply_auth_config(&mut client_config, settings.tls, settings.auth)?;

        let consumer: Arc<MuxConsumer> = Arc::new(
            client_config
                .create_with_context(KafkaContext::new())
                .map_err(|err| Error::Connection {
                    server: settings.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        let (handle, mailbox) = ConsumerHandle::channel(10);
        let actor = KafkaConsumerActor {
            consumer,
            mailbox,
            buffers: HashMap::new(),
            pending_requests: Vec::new(),
        };
        tokio::spawn(async move {
            info!("Starting Kafka consumer actor");
            actor.run().await;
        });
        Ok(handle)
    }

    async fn run(mut self) {
        // Return error if the number of continuous failures exceeds
        // MAX_FAILURE_COUNT. A successful read resets the failure count.
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;
        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    let Some(msg) = msg else {
                        info!("Consumer mailbox closed, stopping actor");
                        break;
                    };
                    if matches!(msg, ConsumerMessage::Stop) {
                        info!("Stopping Kafka consumer actor");
                        break;
                    }
                    if let Err(e) = self.handle_message(msg).await {
                        error!(?e, "Kafka consumer actor failed");
                        break;
                    }
                }

                // Poll only while substreams are waiting for records.
                message = self.consumer.recv(), if !self.pending_requests.is_empty() => {
                    match message {
                        Ok(message) => {
                            continuous_failure_count = 0;
                            let record = record_from(&message);
                            self.buffers
                                .entry(record.topic_partition())
                                .or_default()
                                .push_back(record);
                            fulfil_pending(&mut self.pending_requests, &mut self.buffers);
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                error!(
                                    ?e,
                                    "Failed to read messages after {} retries, terminating",
                                    MAX_FAILURE_COUNT
                                );
                                break;
                            }
                            error!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        info!("Kafka consumer actor terminated");
    }

    async fn handle_message(&mut self, msg: ConsumerMessage) -> Result<()> {
        match msg {
            ConsumerMessage::Subscribe { topics, listener } => {
                self.consumer.context().set_listener(listener);
                let topics: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
                self.consumer
                    .subscribe(&topics)
                    .map_err(|err| Error::Kafka(format!("Failed to subscribe to topics: {err}")))?;
            }
            ConsumerMessage::SubscribePattern { pattern, listener } => {
                self.consumer.context().set_listener(listener);
                self.consumer
                    .subscribe(&[pattern.as_str()])
                    .map_err(|err| Error::Kafka(format!("Failed to subscribe to pattern: {err}")))?;
            }
            ConsumerMessage::Seek { offsets, respond_to } => {
                let status = self.seek(offsets).await;
                let _ = respond_to.send(status);
            }
            ConsumerMessage::RequestMessages {
                tag,
                partitions,
                respond_to,
            } => {
                let records = drain_buffers(&mut self.buffers, &partitions);
                if records.is_empty() {
                    debug!(?partitions, "No buffered records, parking request");
                    self.pending_requests.push(PendingRequest {
                        tag,
                        partitions,
                        respond_to,
                    });
                } else {
                    let _ = respond_to.send(Messages { tag, records });
                }
            }
            ConsumerMessage::Stop => unreachable!("Stop is handled by the run loop"),
        }
        Ok(())
    }

    async fn seek(&mut self, offsets: HashMap<TopicPartition, i64>) -> Result<()> {
        // Records polled before the reposition are stale.
        for tp in offsets.keys() {
            self.buffers.remove(tp);
        }
        // seek is a blocking librdkafka call, so run it off the runtime.
        let consumer = Arc::clone(&self.consumer);
        let task = tokio::task::spawn_blocking(move || {
            for (tp, offset) in offsets {
                consumer
                    .seek(
                        &tp.topic,
                        tp.partition,
                        Offset::Offset(offset),
                        Duration::from_secs(5),
                    )
                    .map_err(|e| {
                        Error::Kafka(format!("Failed to seek {tp} to offset {offset}: {e}"))
                    })?;
            }
            Ok(())
        });
        task.await
            .map_err(|e| Error::Other(format!("Waiting for seek task: {e:?}")))?
    }
}

/// Answers every parked request whose partitions have buffered records.
/// Requests whose substream has gone away are discarded without consuming
/// records, so the partition's next substream still sees them.
fn fulfil_pending(
    pending: &mut Vec<PendingRequest>,
    buffers: &mut HashMap<TopicPartition, VecDeque<KafkaRecord>>,
) {
    let mut still_pending = Vec::new();
    for request in std::mem::take(pending) {
        if request.respond_to.is_closed() {
            continue;
        }
        let records = drain_buffers(buffers, &request.partitions);
        if records.is_empty() {
            still_pending.push(request);
        } else {
            let _ = request.respond_to.send(Messages {
                tag: request.tag,
                records,
            });
        }
    }
    *pending = still_pending;
}

fn drain_buffers(
    buffers: &mut HashMap<TopicPartition, VecDeque<KafkaRecord>>,
    partitions: &BTreeSet<TopicPartition>,
) -> VecDeque<KafkaRecord> {
    let mut records = VecDeque::new();
    for tp in partitions {
        if let Some(buffer) = buffers.get_mut(tp) {
            records.append(buffer);
        }
    }
    records
}

fn record_from(message: &BorrowedMessage<'_>) -> KafkaRecord {
    let headers = match message.headers() {
        Some(headers) => headers
            .iter()
            .map(|header| {
                (
                    header.key.to_string(),
                    String::from_utf8_lossy(header.value.unwrap_or_default()).to_string(),
                )
            })
            .collect(),
        None => HashMap::new(),
    };

    let value = match message.payload() {
        Some(payload) => Bytes::copy_from_slice(payload),
        // The rdkafka doc says that the payload can be None if there is no payload.
        None => Bytes::new(),
    };

    KafkaRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
        value,
        headers,
        timestamp: message.timestamp().to_millis(),
    }
}

fn apply_auth_config(
    client_config: &mut ClientConfig,
    tls: Option<TlsConfig>,
    auth: Option<KafkaAuth>,
) -> Result<()> {
    if let Some(auth) = auth {
        match auth {
            KafkaAuth::Sasl {
                mechanism,
                username,
                password,
            } => {
                let supported_mechanisms = ["PLAIN", "SCRAM-SHA-256", "SCRAM-SHA-512"];
                if !supported_mechanisms.contains(&mechanism.as_str()) {
                    return Err(Error::Kafka(format!(
                        "Unsupported SASL mechanism: {}. Currently supported mechanisms: {}",
                        mechanism,
                        supported_mechanisms.join(", ")
                    )));
                }
                client_config.set("security.protocol", "SASL_PLAINTEXT");
                if tls.is_some() {
                    client_config.set("security.protocol", "SASL_SSL");
                }
                client_config
                    .set("sasl.mechanisms", mechanism)
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
        }
    }

    if let Some(tls_config) = tls {
        client_config.set("security.protocol", "SSL");
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config.set("enable.ssl.certificate.verification", "false");
        }
        if let Some(ca_cert) = tls_config.ca_cert {
            client_config.set("ssl.ca.pem", ca_cert);
        }
        if let Some(client_auth) = tls_config.client_auth {
            client_config
                .set("ssl.certificate.pem", client_auth.client_cert)
                .set("ssl.key.pem", client_auth.client_cert_private_key);
        }
    }

    Ok(())
}
