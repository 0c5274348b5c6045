//! In-process consumer actor for tests.
//!
//! Speaks the production mailbox contract over a real [`ConsumerHandle`]:
//! requests park until records are pushed for one of their partitions, seeks
//! and stops are surfaced as events the test can assert on, and the rebalance
//! listener registered by the multiplexer is handed back so tests can drive
//! assignments and revocations.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::consumer::{ConsumerHandle, ConsumerMailbox, ConsumerMessage, RebalanceListener};
use crate::message::{KafkaRecord, Messages, TopicPartition};
use crate::Result;

pub(crate) enum ConsumerEvent {
    Subscribed {
        topics: Vec<String>,
        listener: RebalanceListener,
    },
    SubscribedPattern {
        pattern: String,
        listener: RebalanceListener,
    },
    Seeked(HashMap<TopicPartition, i64>),
    Requested(BTreeSet<TopicPartition>),
    Stopped,
}

enum Op {
    Push {
        tp: TopicPartition,
        records: Vec<KafkaRecord>,
    },
    HoldSeeks,
    Crash,
}

pub(crate) struct ScriptedConsumer {
    pub(crate) handle: ConsumerHandle,
    ops: mpsc::UnboundedSender<Op>,
    events: mpsc::UnboundedReceiver<ConsumerEvent>,
}

impl ScriptedConsumer {
    pub(crate) fn start() -> Self {
        let (handle, mailbox) = ConsumerHandle::channel(10);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(actor(mailbox, ops_rx, events_tx));
        Self {
            handle,
            ops: ops_tx,
            events: events_rx,
        }
    }

    /// Makes records with the given values available for `tp`. Parked
    /// requests for the partition are answered immediately.
    pub(crate) fn push_records(&self, tp: &TopicPartition, values: std::ops::RangeInclusive<i64>) {
        let records = values.map(|value| record(tp, value)).collect();
        let _ = self.ops.send(Op::Push {
            tp: tp.clone(),
            records,
        });
    }

    /// Park seek replies instead of answering them.
    pub(crate) fn hold_seeks(&self) {
        let _ = self.ops.send(Op::HoldSeeks);
    }

    /// Terminates the actor abruptly, as a fatal poll failure would.
    pub(crate) fn crash(&self) {
        let _ = self.ops.send(Op::Crash);
    }

    /// Waits for a subscription and returns the registered listener.
    pub(crate) async fn expect_listener(&mut self) -> RebalanceListener {
        loop {
            match self.next_event().await {
                ConsumerEvent::Subscribed { listener, .. }
                | ConsumerEvent::SubscribedPattern { listener, .. } => return listener,
                _ => {}
            }
        }
    }

    pub(crate) async fn expect_seeked(&mut self) -> HashMap<TopicPartition, i64> {
        loop {
            if let ConsumerEvent::Seeked(offsets) = self.next_event().await {
                return offsets;
            }
        }
    }

    pub(crate) async fn expect_stopped(&mut self) {
        loop {
            if let ConsumerEvent::Stopped = self.next_event().await {
                return;
            }
        }
    }

    pub(crate) async fn next_event(&mut self) -> ConsumerEvent {
        self.events.recv().await.expect("consumer actor events closed")
    }
}

pub(crate) fn record(tp: &TopicPartition, value: i64) -> KafkaRecord {
    KafkaRecord {
        topic: tp.topic.clone(),
        partition: tp.partition,
        offset: value,
        key: None,
        value: Bytes::from(value.to_string()),
        headers: HashMap::new(),
        timestamp: None,
    }
}

async fn actor(
    mut mailbox: ConsumerMailbox,
    mut ops: mpsc::UnboundedReceiver<Op>,
    events: mpsc::UnboundedSender<ConsumerEvent>,
) {
    let mut buffers: HashMap<TopicPartition, VecDeque<KafkaRecord>> = HashMap::new();
    let mut parked: Vec<(u32, BTreeSet<TopicPartition>, oneshot::Sender<Messages>)> = Vec::new();
    let mut hold_seeks = false;
    let mut held_seeks: Vec<oneshot::Sender<Result<()>>> = Vec::new();

    loop {
        tokio::select! {
            msg = mailbox.recv() => match msg {
                None => break,
                Some(ConsumerMessage::Subscribe { topics, listener }) => {
                    let _ = events.send(ConsumerEvent::Subscribed { topics, listener });
                }
                Some(ConsumerMessage::SubscribePattern { pattern, listener }) => {
                    let _ = events.send(ConsumerEvent::SubscribedPattern { pattern, listener });
                }
                Some(ConsumerMessage::Seek { offsets, respond_to }) => {
                    let _ = events.send(ConsumerEvent::Seeked(offsets));
                    if hold_seeks {
                        held_seeks.push(respond_to);
                    } else {
                        let _ = respond_to.send(Ok(()));
                    }
                }
                Some(ConsumerMessage::RequestMessages { tag, partitions, respond_to }) => {
                    let _ = events.send(ConsumerEvent::Requested(partitions.clone()));
                    let records = take_buffered(&mut buffers, &partitions);
                    if records.is_empty() {
                        parked.push((tag, partitions, respond_to));
                    } else {
                        let _ = respond_to.send(Messages { tag, records });
                    }
                }
                Some(ConsumerMessage::Stop) => {
                    let _ = events.send(ConsumerEvent::Stopped);
                    break;
                }
            },

            Some(op) = ops.recv() => match op {
                Op::Push { tp, records } => {
                    buffers.entry(tp).or_default().extend(records);
                    parked = fulfil(parked, &mut buffers);
                }
                Op::HoldSeeks => hold_seeks = true,
                Op::Crash => break,
            },
        }
    }
}

fn fulfil(
    parked: Vec<(u32, BTreeSet<TopicPartition>, oneshot::Sender<Messages>)>,
    buffers: &mut HashMap<TopicPartition, VecDeque<KafkaRecord>>,
) -> Vec<(u32, BTreeSet<TopicPartition>, oneshot::Sender<Messages>)> {
    let mut still_parked = Vec::new();
    for (tag, partitions, respond_to) in parked {
        // A request whose substream is gone must not consume records.
        if respond_to.is_closed() {
            continue;
        }
        let records = take_buffered(buffers, &partitions);
        if records.is_empty() {
            still_parked.push((tag, partitions, respond_to));
        } else {
            let _ = respond_to.send(Messages { tag, records });
        }
    }
    still_parked
}

fn take_buffered(
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
