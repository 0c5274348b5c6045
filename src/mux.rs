//! The partitioned source: a stream of `(TopicPartition, SubSource)` pairs.
//!
//! A single task owns all partition bookkeeping. Between command executions a
//! partition lives in at most one of: pending (assigned, not yet emitted),
//! startup (emitted, substream not yet announced), running (substream
//! announced), or under revocation. Rebalance notifications, substream
//! lifecycle callbacks, the grace timer, and control commands are all
//! serialised into the task's command queue; downstream demand is the
//! capacity of the output channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::{ConsumerSettings, MuxSettings, Subscription};
use crate::consumer::{ConsumerHandle, KafkaConsumerActor, RebalanceEvent, RebalanceListener};
use crate::message::{MessageBuilder, TopicPartition};
use crate::sub_source::{self, SubSource, SubSourceControl};
use crate::{Error, Result};

/// Hard-coded timeout on the Seek round-trip during seek-on-assign.
const SEEK_ASK_TIMEOUT: Duration = Duration::from_secs(10);

/// The stream produced by [`PartitionedSource`]. Substreams are independent
/// and may be consumed in any order; an unconsumed substream does not
/// back-pressure this stream.
pub type PartitionedStream<M> = ReceiverStream<Result<(TopicPartition, SubSource<M>)>>;

/// Commands serialised into the multiplexer task.
#[derive(Debug)]
pub(crate) enum MuxCommand {
    SubStarted {
        tp: TopicPartition,
        control: SubSourceControl,
    },
    SubCancelled {
        tp: TopicPartition,
    },
    SeekDone {
        partitions: BTreeSet<TopicPartition>,
    },
    SeekFailed {
        partitions: BTreeSet<TopicPartition>,
        reason: String,
    },
    RevokeTimer {
        generation: u64,
    },
    Stop,
    Shutdown,
}

/// Entry points for building a partitioned source.
pub struct PartitionedSource;

impl PartitionedSource {
    /// Creates the Kafka consumer actor from `consumer_settings` and starts
    /// the multiplexer on top of it. The multiplexer is the actor's sole
    /// lifecycle owner.
    pub async fn start<B>(
        consumer_settings: ConsumerSettings,
        settings: MuxSettings,
        builder: B,
    ) -> Result<(PartitionedStream<B::Msg>, SourceControl)>
    where
        B: MessageBuilder,
    {
        let consumer = KafkaConsumerActor::start(consumer_settings).await?;
        Ok(Self::with_consumer(consumer, settings, builder))
    }

    /// Starts the multiplexer on top of an existing consumer actor handle.
    pub fn with_consumer<B>(
        consumer: ConsumerHandle,
        settings: MuxSettings,
        builder: B,
    ) -> (PartitionedStream<B::Msg>, SourceControl)
    where
        B: MessageBuilder,
    {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (listener, rebalances) = RebalanceListener::channel();

        let mux = Multiplexer {
            settings,
            consumer,
            builder: Arc::new(builder),
            commands_tx: commands_tx.clone(),
            commands_rx,
            rebalances,
            out: out_tx,
            pending_partitions: BTreeSet::new(),
            partitions_in_startup: BTreeSet::new(),
            sub_sources: HashMap::new(),
            partitions_to_revoke: BTreeSet::new(),
            revoke_generation: 0,
            sub_tasks: JoinSet::new(),
        };
        let done = tokio::spawn(mux.run(listener));

        (
            ReceiverStream::new(out_rx),
            SourceControl {
                commands: commands_tx,
                done,
            },
        )
    }
}

/// Handle to stop or shut down the whole partitioned source.
pub struct SourceControl {
    commands: mpsc::UnboundedSender<MuxCommand>,
    done: JoinHandle<Result<()>>,
}

impl SourceControl {
    /// Cooperative drain: every substream delivers what it has buffered and
    /// completes, the output completes, and the consumer actor is stopped
    /// once all substreams have finished.
    pub async fn stop(self) -> Result<()> {
        let _ = self.commands.send(MuxCommand::Stop);
        self.wait().await
    }

    /// Forced shutdown: substreams complete immediately, then the consumer
    /// actor is stopped and awaited.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(MuxCommand::Shutdown);
        self.wait().await
    }

    /// Awaits termination without requesting it.
    pub async fn wait(self) -> Result<()> {
        match self.done.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("Multiplexer task failed: {e}"))),
        }
    }
}

enum Outcome {
    Drain,
    Forced(Option<Error>),
}

enum LoopAction {
    SubStarted(TopicPartition, SubSourceControl),
    SubCancelled(TopicPartition),
    Admit(BTreeSet<TopicPartition>),
    RevokeTimer(u64),
    Assigned(BTreeSet<TopicPartition>),
    Revoked(BTreeSet<TopicPartition>),
    None,
}

struct Multiplexer<B: MessageBuilder> {
    settings: MuxSettings,
    consumer: ConsumerHandle,
    builder: Arc<B>,
    commands_tx: mpsc::UnboundedSender<MuxCommand>,
    commands_rx: mpsc::UnboundedReceiver<MuxCommand>,
    rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    out: mpsc::Sender<Result<(TopicPartition, SubSource<B::Msg>)>>,

    /// Assigned by Kafka, not yet emitted downstream.
    pending_partitions: BTreeSet<TopicPartition>,
    /// Emitted downstream; the substream has not announced itself yet.
    partitions_in_startup: BTreeSet<TopicPartition>,
    /// Running substreams, keyed by partition.
    sub_sources: HashMap<TopicPartition, SubSourceControl>,
    /// Partitions inside the revocation grace window.
    partitions_to_revoke: BTreeSet<TopicPartition>,
    /// Bumped on every revoke notification; a grace timer only acts if its
    /// generation is still current, which makes cancellation race-free with
    /// firing.
    revoke_generation: u64,
    sub_tasks: JoinSet<()>,
}

impl<B: MessageBuilder> Multiplexer<B> {
    async fn run(mut self, listener: RebalanceListener) -> Result<()> {
        match self.settings.subscription.clone() {
            Subscription::Topics(topics) => {
                info!(?topics, "Subscribing to topics");
                self.consumer.subscribe(topics, listener).await;
            }
            Subscription::Pattern(pattern) => {
                info!(%pattern, "Subscribing to topic pattern");
                self.consumer.subscribe_pattern(pattern, listener).await;
            }
        }

        match self.run_loop().await {
            Outcome::Drain => self.drain().await,
            Outcome::Forced(failure) => self.force_shutdown(failure).await,
        }
    }

    async fn run_loop(&mut self) -> Outcome {
        loop {
            let can_emit = self
                .pending_partitions
                .iter()
                .any(|tp| !self.partitions_to_revoke.contains(tp));

            // The reserved permit below borrows `self.out` for the whole
            // `select!` statement (including arms that don't win), so any
            // arm that needs `&mut self` must defer its call until after
            // that statement (and its borrow of `self.out`) has ended.
            let action = tokio::select! {
                Some(cmd) = self.commands_rx.recv() => match cmd {
                    MuxCommand::SubStarted { tp, control } => LoopAction::SubStarted(tp, control),
                    MuxCommand::SubCancelled { tp } => LoopAction::SubCancelled(tp),
                    MuxCommand::SeekDone { partitions } => {
                        debug!(?partitions, "Seek completed, admitting partitions");
                        LoopAction::Admit(partitions)
                    }
                    MuxCommand::SeekFailed { partitions, reason } => {
                        return Outcome::Forced(Some(Error::SeekFailed {
                            partitions: partitions.into_iter().collect(),
                            reason,
                        }));
                    }
                    MuxCommand::RevokeTimer { generation } => LoopAction::RevokeTimer(generation),
                    MuxCommand::Stop => return Outcome::Drain,
                    MuxCommand::Shutdown => return Outcome::Forced(None),
                },

                Some(event) = self.rebalances.recv() => match event {
                    RebalanceEvent::Assigned(partitions) => LoopAction::Assigned(partitions),
                    RebalanceEvent::Revoked(partitions) => LoopAction::Revoked(partitions),
                },

                _ = self.consumer.terminated() => {
                    return Outcome::Forced(Some(Error::ConsumerFailed(
                        "Kafka consumer actor terminated unexpectedly".to_string(),
                    )));
                }

                permit = self.out.reserve(), if can_emit => match permit {
                    Ok(permit) => {
                        let next = self
                            .pending_partitions
                            .iter()
                            .find(|tp| !self.partitions_to_revoke.contains(*tp))
                            .cloned();
                        let Some(tp) = next else { continue };
                        self.pending_partitions.remove(&tp);
                        self.partitions_in_startup.insert(tp.clone());
                        let sub = sub_source::spawn(
                            tp.clone(),
                            self.consumer.clone(),
                            Arc::clone(&self.builder),
                            self.commands_tx.clone(),
                            &mut self.sub_tasks,
                        );
                        debug!(%tp, "Emitting substream");
                        permit.send(Ok((tp, sub)));
                        LoopAction::None
                    }
                    Err(_) => return Outcome::Forced(None),
                },

                _ = self.out.closed(), if !can_emit => return Outcome::Forced(None),
            };

            match action {
                LoopAction::SubStarted(tp, control) => self.on_sub_started(tp, control),
                LoopAction::SubCancelled(tp) => self.on_sub_cancelled(tp),
                LoopAction::Admit(partitions) => self.admit(partitions),
                LoopAction::RevokeTimer(generation) => self.on_revoke_timer(generation),
                LoopAction::Assigned(partitions) => self.on_assigned(partitions),
                LoopAction::Revoked(partitions) => self.on_revoked(partitions),
                LoopAction::None => {}
            }
        }
    }

    fn on_assigned(&mut self, assigned: BTreeSet<TopicPartition>) {
        info!(?assigned, "Partitions assigned");
        // A partition re-assigned inside its grace window stays with its
        // existing substream.
        let partitions: BTreeSet<TopicPartition> = assigned
            .iter()
            .filter(|tp| !self.partitions_to_revoke.contains(*tp))
            .cloned()
            .collect();
        // The assignment cancels any pending revocation of these partitions.
        self.partitions_to_revoke
            .retain(|tp| !assigned.contains(tp));
        if partitions.is_empty() {
            return;
        }

        match self.settings.offsets_on_assign.as_ref() {
            Some(hook) => {
                let offsets_fut = hook(partitions.clone());
                let consumer = self.consumer.clone();
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    let result = async {
                        let offsets = offsets_fut.await?;
                        match tokio::time::timeout(SEEK_ASK_TIMEOUT, consumer.seek(offsets)).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::Kafka(format!(
                                "Seek did not complete within {:?}",
                                SEEK_ASK_TIMEOUT
                            ))),
                        }
                    }
                    .await;
                    let cmd = match result {
                        Ok(()) => MuxCommand::SeekDone { partitions },
                        Err(e) => MuxCommand::SeekFailed {
                            partitions,
                            reason: e.to_string(),
                        },
                    };
                    let _ = commands.send(cmd);
                });
            }
            None => self.admit(partitions),
        }
    }

    fn admit(&mut self, partitions: BTreeSet<TopicPartition>) {
        for tp in partitions {
            if !self.partitions_in_startup.contains(&tp)
                && !self.partitions_to_revoke.contains(&tp)
            {
                self.pending_partitions.insert(tp);
            }
        }
    }

    fn on_revoked(&mut self, revoked: BTreeSet<TopicPartition>) {
        info!(?revoked, "Partitions revoked, starting grace timer");
        // Only the latest timer acts; overlapping revoke batches merge into
        // one cumulative set.
        self.revoke_generation += 1;
        self.partitions_to_revoke.extend(revoked);

        let generation = self.revoke_generation;
        let delay = self.settings.wait_close_partition;
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(MuxCommand::RevokeTimer { generation });
        });
    }

    fn on_revoke_timer(&mut self, generation: u64) {
        if generation != self.revoke_generation {
            return;
        }
        if self.partitions_to_revoke.is_empty() {
            // Everything was re-assigned inside the grace window.
            return;
        }
        let revoked = std::mem::take(&mut self.partitions_to_revoke);
        info!(?revoked, "Grace window expired, closing revoked substreams");
        if let Some(hook) = self.settings.on_revoke.as_ref() {
            hook(&revoked);
        }
        for tp in &revoked {
            self.pending_partitions.remove(tp);
            self.partitions_in_startup.remove(tp);
            if let Some(control) = self.sub_sources.remove(tp) {
                control.shutdown();
            }
        }
    }

    fn on_sub_started(&mut self, tp: TopicPartition, control: SubSourceControl) {
        if self.partitions_in_startup.remove(&tp) {
            self.sub_sources.insert(tp, control);
        } else {
            // Revoked while starting up.
            debug!(%tp, "Substream started for a partition no longer owned, closing it");
            control.shutdown();
        }
    }

    fn on_sub_cancelled(&mut self, tp: TopicPartition) {
        // Kafka still considers us subscribed to the partition; another
        // downstream pull may create a fresh substream for it.
        debug!(%tp, "Substream finished downstream, partition returns to pending");
        self.sub_sources.remove(&tp);
        self.partitions_in_startup.remove(&tp);
        self.pending_partitions.insert(tp);
    }

    /// Cooperative teardown: substreams drain, the output completes, and the
    /// consumer actor is stopped only after every substream task has finished.
    async fn drain(self) -> Result<()> {
        info!("Draining partitioned source");
        let Multiplexer {
            consumer,
            out,
            mut sub_tasks,
            mut commands_rx,
            sub_sources,
            ..
        } = self;

        for control in sub_sources.into_values() {
            control.stop();
        }
        drop(out);

        loop {
            tokio::select! {
                joined = sub_tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) => warn!(?e, "Substream task failed during drain"),
                    Some(Ok(())) => {}
                },
                Some(cmd) = commands_rx.recv() => {
                    if let MuxCommand::SubStarted { control, .. } = cmd {
                        control.stop();
                    }
                }
            }
        }

        consumer.stop().await;
        consumer.terminated().await;
        info!("Partitioned source stopped");
        Ok(())
    }

    /// Forced teardown: substreams are closed immediately, a failure (if any)
    /// is delivered downstream and to every live substream, and the consumer
    /// actor is stopped only after every substream task has finished.
    async fn force_shutdown(self, failure: Option<Error>) -> Result<()> {
        match &failure {
            Some(e) => warn!(%e, "Shutting down partitioned source after failure"),
            None => info!("Shutting down partitioned source"),
        }
        let Multiplexer {
            consumer,
            out,
            mut sub_tasks,
            mut commands_rx,
            sub_sources,
            ..
        } = self;

        for control in sub_sources.into_values() {
            match failure.clone() {
                Some(error) => control.fail(error),
                None => control.shutdown(),
            }
        }

        if let Some(failure) = failure.clone() {
            if let Err(TrySendError::Full(item)) = out.try_send(Err(failure)) {
                // Downstream holds an unconsumed element; deliver the failure
                // once it drains, then let the clone close the channel.
                let out = out.clone();
                tokio::spawn(async move {
                    let _ = out.send(item).await;
                });
            }
        }
        drop(out);

        loop {
            tokio::select! {
                joined = sub_tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) => warn!(?e, "Substream task failed during shutdown"),
                    Some(Ok(())) => {}
                },
                Some(cmd) = commands_rx.recv() => {
                    if let MuxCommand::SubStarted { control, .. } = cmd {
                        match failure.clone() {
                            Some(error) => control.fail(error),
                            None => control.shutdown(),
                        }
                    }
                }
            }
        }

        consumer.stop().await;
        consumer.terminated().await;
        info!("Partitioned source terminated");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
