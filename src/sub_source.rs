//! Per-partition substreams emitted by the partitioned source.
//!
//! Each substream runs on its own task and serves exactly one partition. It
//! announces itself to the multiplexer on startup, pulls records from the
//! consumer actor one batch at a time (never more than one request in flight,
//! and only issued against held downstream demand), and reports downstream
//! cancellation back so the partition can be handed to another consumer.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consumer::ConsumerHandle;
use crate::message::{KafkaRecord, MessageBuilder, TopicPartition};
use crate::mux::MuxCommand;
use crate::{Error, Result};

/// Tag carried on every message request issued by a substream.
const REQUEST_TAG: u32 = 0;

/// A stream of transformed messages for a single partition.
///
/// Ends when the partition is revoked or the source shuts down; when the
/// stage fails (consumer death, seek failure) the last item is the failure.
pub struct SubSource<M> {
    tp: TopicPartition,
    inner: ReceiverStream<Result<M>>,
}

impl<M> SubSource<M> {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }
}

impl<M> Stream for SubSource<M> {
    type Item = Result<M>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<M> fmt::Debug for SubSource<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubSource").field(&self.tp).finish()
    }
}

/// Handle held by the multiplexer to end a substream.
#[derive(Clone, Debug)]
pub struct SubSourceControl {
    stop: CancellationToken,
    force: CancellationToken,
    failure: Arc<Mutex<Option<Error>>>,
}

impl SubSourceControl {
    pub(crate) fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Cooperative drain: already buffered records are still delivered, then
    /// the substream completes.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Forced: the substream completes from whatever it is doing.
    pub fn shutdown(&self) {
        self.force.cancel();
    }

    /// Forced shutdown carrying a failure; the substream delivers it
    /// downstream before completing.
    pub(crate) fn fail(&self, error: Error) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = Some(error);
        }
        self.force.cancel();
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Spawns the task serving one partition and returns the downstream-facing
/// stream. The task is tracked in `tasks` so the multiplexer can wait for all
/// substreams to finish before stopping the consumer actor.
pub(crate) fn spawn<B: MessageBuilder>(
    tp: TopicPartition,
    consumer: ConsumerHandle,
    builder: Arc<B>,
    callbacks: mpsc::UnboundedSender<MuxCommand>,
    tasks: &mut JoinSet<()>,
) -> SubSource<B::Msg> {
    let (out_tx, out_rx) = mpsc::channel(1);
    let task = SubSourceTask {
        tp: tp.clone(),
        consumer,
        builder,
        out: out_tx,
        control: SubSourceControl::new(),
        callbacks,
    };
    tasks.spawn(task.run());
    SubSource {
        tp,
        inner: ReceiverStream::new(out_rx),
    }
}

struct SubSourceTask<B: MessageBuilder> {
    tp: TopicPartition,
    consumer: ConsumerHandle,
    builder: Arc<B>,
    out: mpsc::Sender<Result<B::Msg>>,
    control: SubSourceControl,
    callbacks: mpsc::UnboundedSender<MuxCommand>,
}

impl<B: MessageBuilder> SubSourceTask<B> {
    async fn run(self) {
        let _ = self.callbacks.send(MuxCommand::SubStarted {
            tp: self.tp.clone(),
            control: self.control.clone(),
        });
        debug!(tp = %self.tp, "Substream started");

        let mut buffer: VecDeque<KafkaRecord> = VecDeque::new();
        loop {
            // A request is only ever issued against a held output permit, so
            // demand exists for whatever the reply brings.
            let permit = tokio::select! {
                biased;

                _ = self.control.force.cancelled() => {
                    self.deliver_failure();
                    break;
                }
                _ = self.control.stop.cancelled(), if buffer.is_empty() => break,
                permit = self.out.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.notify_cancelled();
                        break;
                    }
                },
            };

            if buffer.is_empty() {
                let messages = tokio::select! {
                    biased;

                    _ = self.control.force.cancelled() => {
                        if let Some(error) = self.control.take_failure() {
                            permit.send(Err(error));
                        }
                        break;
                    }
                    _ = self.control.stop.cancelled() => break,
                    _ = self.out.closed() => {
                        self.notify_cancelled();
                        break;
                    }
                    _ = self.consumer.terminated() => {
                        permit.send(Err(Error::ConsumerFailed(format!(
                            "Kafka consumer terminated while serving {}",
                            self.tp
                        ))));
                        break;
                    }
                    reply = self.consumer.request_messages(
                        REQUEST_TAG,
                        BTreeSet::from([self.tp.clone()]),
                    ) => match reply {
                        Ok(messages) => messages,
                        Err(e) => {
                            permit.send(Err(Error::ConsumerFailed(e.to_string())));
                            break;
                        }
                    },
                };
                let mut records = messages.records;
                buffer.append(&mut records);
                if buffer.is_empty() {
                    continue;
                }
            }

            if let Some(record) = buffer.pop_front() {
                permit.send(Ok(self.builder.create_message(record)));
            }
        }
        debug!(tp = %self.tp, "Substream stopped");
    }

    fn notify_cancelled(&self) {
        debug!(tp = %self.tp, "Substream cancelled by downstream");
        let _ = self.callbacks.send(MuxCommand::SubCancelled {
            tp: self.tp.clone(),
        });
    }

    /// Delivers a failure pushed through the control handle. When the output
    /// still holds an unconsumed element, the failure follows once downstream
    /// drains it.
    fn deliver_failure(&self) {
        let Some(error) = self.control.take_failure() else {
            return;
        };
        if let Err(TrySendError::Full(item)) = self.out.try_send(Err(error)) {
            let out = self.out.clone();
            tokio::spawn(async move {
                let _ = out.send(item).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConsumer;
    use tokio_stream::StreamExt;

    fn offset_builder() -> impl MessageBuilder<Msg = i64> {
        |record: KafkaRecord| record.offset
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", 0)
    }

    #[tokio::test]
    async fn announces_start_and_reports_downstream_cancel() {
        let consumer = ScriptedConsumer::start();
        let (callbacks, mut commands) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let sub = spawn(
            tp(),
            consumer.handle.clone(),
            Arc::new(offset_builder()),
            callbacks,
            &mut tasks,
        );
        assert_eq!(sub.topic_partition(), &tp());

        match commands.recv().await {
            Some(MuxCommand::SubStarted { tp: started, .. }) => assert_eq!(started, tp()),
            other => panic!("Expected a start notification, got {other:?}"),
        }

        drop(sub);
        match commands.recv().await {
            Some(MuxCommand::SubCancelled { tp: cancelled }) => assert_eq!(cancelled, tp()),
            other => panic!("Expected a cancel notification, got {other:?}"),
        }
        assert!(tasks.join_next().await.is_some());
    }

    #[tokio::test]
    async fn stop_delivers_buffered_records_before_completing() {
        let consumer = ScriptedConsumer::start();
        consumer.push_records(&tp(), 1..=2);
        let (callbacks, mut commands) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let mut sub = spawn(
            tp(),
            consumer.handle.clone(),
            Arc::new(offset_builder()),
            callbacks,
            &mut tasks,
        );
        let control = match commands.recv().await {
            Some(MuxCommand::SubStarted { control, .. }) => control,
            other => panic!("Expected a start notification, got {other:?}"),
        };

        // The first pull requests both records in one batch.
        assert_eq!(sub.next().await.expect("ended").expect("failed"), 1);

        control.stop();
        assert_eq!(sub.next().await.expect("ended").expect("failed"), 2);
        assert!(sub.next().await.is_none());
        assert!(tasks.join_next().await.is_some());
    }

    #[tokio::test]
    async fn forced_failure_is_delivered_downstream() {
        let consumer = ScriptedConsumer::start();
        let (callbacks, mut commands) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let mut sub = spawn(
            tp(),
            consumer.handle.clone(),
            Arc::new(offset_builder()),
            callbacks,
            &mut tasks,
        );
        let control = match commands.recv().await {
            Some(MuxCommand::SubStarted { control, .. }) => control,
            other => panic!("Expected a start notification, got {other:?}"),
        };

        control.fail(Error::ConsumerFailed("poll loop gone".to_string()));

        let err = sub
            .next()
            .await
            .expect("substream should surface the failure")
            .expect_err("substream should fail");
        assert!(err.is_consumer_failure());
        assert!(sub.next().await.is_none());
        assert!(tasks.join_next().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_completes_without_draining() {
        let consumer = ScriptedConsumer::start();
        consumer.push_records(&tp(), 1..=5);
        let (callbacks, mut commands) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let mut sub = spawn(
            tp(),
            consumer.handle.clone(),
            Arc::new(offset_builder()),
            callbacks,
            &mut tasks,
        );
        let control = match commands.recv().await {
            Some(MuxCommand::SubStarted { control, .. }) => control,
            other => panic!("Expected a start notification, got {other:?}"),
        };

        assert_eq!(sub.next().await.expect("ended").expect("failed"), 1);
        control.shutdown();

        // At most the already-pushed element may still be in flight; the
        // stream must end without delivering the rest of the buffer.
        let mut remaining = 0;
        while let Some(item) = sub.next().await {
            item.expect("substream failed");
            remaining += 1;
        }
        assert!(remaining <= 1, "buffer drained after forced shutdown");
        assert!(tasks.join_next().await.is_some());
    }
}
