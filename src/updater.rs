//! Subscription updater actor.
//!
//! Owns a node's local subscription store and its periodic replication
//! cycle. All store mutation happens synchronously inside this task;
//! replicated writes are issued asynchronously with at most one in flight,
//! and their completion comes back as a message.
//!
//! The actor is a two-state machine. In `Waiting` no replicated write is
//! pending; in `Updating` one is. Requests mutate the store in either
//! state; only the tick handler and the write-completion handler move
//! between states.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::bloom::BloomFilter;
use crate::config::PubSubConfig;
use crate::dispatch::DispatchCommand;
use crate::error::{PubSubError, ReplicaError};
use crate::hashing::HashFamily;
use crate::messages::{Consistency, LocalSubscriber, NodeAddress, SubscriberId};
use crate::metrics::MetricsSink;
use crate::replica::ReplicaWriter;
use crate::store::{LocalSnapshot, TopicStore};

/// Acknowledgement channel for requests that asked for one.
pub type AckSender = oneshot::Sender<Result<(), PubSubError>>;

/// Commands accepted by the subscription updater.
pub enum UpdaterCommand {
    Subscribe {
        topics: BTreeSet<String>,
        subscriber: LocalSubscriber,
        consistency: Consistency,
        ack: Option<AckSender>,
    },
    Unsubscribe {
        topics: BTreeSet<String>,
        subscriber: SubscriberId,
        consistency: Consistency,
        ack: Option<AckSender>,
    },
    RemoveSubscriber {
        subscriber: SubscriberId,
        consistency: Consistency,
        ack: Option<AckSender>,
    },
    /// A node left the cluster; delete its replicated entry.
    NodeRemoved { node: NodeAddress },
    /// Stop immediately; the supervisor restarts the sibling group.
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdaterState {
    Waiting,
    Updating,
}

pub(crate) struct SubscriptionUpdater {
    node: NodeAddress,
    config: PubSubConfig,
    family: Arc<HashFamily>,
    commands: mpsc::UnboundedReceiver<UpdaterCommand>,
    dispatch: mpsc::UnboundedSender<DispatchCommand>,
    writer: Arc<dyn ReplicaWriter<BloomFilter>>,
    metrics: Arc<dyn MetricsSink>,

    store: TopicStore,
    state: UpdaterState,
    /// Requests waiting for the next flush to be issued.
    await_update: Vec<AckSender>,
    /// Requests waiting for the issued flush to be confirmed.
    await_sub_ack: Vec<AckSender>,
    /// Strongest consistency requested since the last flush.
    pending_consistency: Consistency,
    /// Completion channel of the single in-flight write.
    write_rx: Option<oneshot::Receiver<Result<(), ReplicaError>>>,
    /// Snapshot taken when the in-flight write was issued; pushed to the
    /// dispatch actor once the write confirms.
    pending_snapshot: Option<LocalSnapshot>,
}

impl SubscriptionUpdater {
    pub(crate) fn new(
        node: NodeAddress,
        config: PubSubConfig,
        family: Arc<HashFamily>,
        commands: mpsc::UnboundedReceiver<UpdaterCommand>,
        dispatch: mpsc::UnboundedSender<DispatchCommand>,
        writer: Arc<dyn ReplicaWriter<BloomFilter>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            node,
            config,
            family,
            commands,
            dispatch,
            writer,
            metrics,
            store: TopicStore::new(),
            state: UpdaterState::Waiting,
            await_update: Vec::new(),
            await_sub_ack: Vec::new(),
            pending_consistency: Consistency::WEAKEST,
            write_rx: None,
            pending_snapshot: None,
        }
    }

    pub(crate) async fn run(mut self) {
        // A fresh updater starts from empty truth; the first tick replaces
        // (or clears) whatever entry a predecessor left replicated.
        self.store.mark_dirty();

        let mut ticker = tokio::time::interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; swallow it so a tick
        // always means one full interval has passed.
        ticker.tick().await;

        loop {
            let write_in_flight = self.write_rx.is_some();
            tokio::select! {
                maybe_command = self.commands.recv() => match maybe_command {
                    Some(UpdaterCommand::Kill) => {
                        warn!(node = %self.node, "Subscription updater killed");
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => return,
                },
                _ = ticker.tick() => self.on_tick(),
                result = wait_write(&mut self.write_rx), if write_in_flight => {
                    self.on_write_complete(result);
                }
            }
        }
    }

    fn handle_command(&mut self, command: UpdaterCommand) {
        match command {
            UpdaterCommand::Subscribe {
                topics,
                subscriber,
                consistency,
                ack,
            } => {
                let subscriber_id = subscriber.id;
                let changed = self.store.subscribe(subscriber, &topics);
                trace!(
                    node = %self.node,
                    subscriber = %subscriber_id,
                    ?topics,
                    changed,
                    "Subscribe"
                );
                self.note_request(consistency, ack);
            }
            UpdaterCommand::Unsubscribe {
                topics,
                subscriber,
                consistency,
                ack,
            } => {
                let changed = self.store.unsubscribe(subscriber, &topics);
                trace!(node = %self.node, subscriber = %subscriber, ?topics, changed, "Unsubscribe");
                self.note_request(consistency, ack);
            }
            UpdaterCommand::RemoveSubscriber {
                subscriber,
                consistency,
                ack,
            } => {
                let changed = self.store.remove_subscriber(subscriber);
                trace!(node = %self.node, subscriber = %subscriber, changed, "Remove subscriber");
                self.note_request(consistency, ack);
            }
            UpdaterCommand::NodeRemoved { node } => self.clear_departed_node(node),
            UpdaterCommand::Kill => unreachable!("handled in run loop"),
        }
    }

    /// Bookkeeping shared by every store mutation request: escalate the
    /// pending write consistency and queue the acknowledgement.
    fn note_request(&mut self, consistency: Consistency, ack: Option<AckSender>) {
        self.pending_consistency = self.pending_consistency.strongest(consistency);
        if let Some(ack) = ack {
            self.await_update.push(ack);
        }
    }

    fn on_tick(&mut self) {
        // Closed mailboxes count as terminated subscribers.
        let swept = self.store.sweep_closed();
        if swept > 0 {
            debug!(node = %self.node, swept, "Swept terminated subscribers");
        }

        // Acknowledgements advance one stage per tick regardless of state.
        self.await_sub_ack.append(&mut self.await_update);

        if self.state == UpdaterState::Updating {
            return;
        }

        let force = self.config.force_update_probability > 0.0
            && rand::random::<f64>() < self.config.force_update_probability;

        if !self.store.is_dirty() && !force {
            // Nothing to write. The no-op "write" succeeds trivially, so
            // waiting acknowledgements are released rather than starved.
            self.release_acks();
            return;
        }

        if force {
            debug!(node = %self.node, "Force update fired");
        }
        self.issue_write();
    }

    fn issue_write(&mut self) {
        let consistency = self.pending_consistency;
        // An empty store clears this node's replicated entry instead of
        // putting an empty filter.
        let export = (!self.store.is_empty()).then(|| {
            self.store.export_filter(
                &self.family,
                self.config.expected_topics,
                self.config.false_positive_rate,
                self.config.buffer_factor,
            )
        });

        self.pending_snapshot = Some(self.store.snapshot());
        self.metrics.topic_count(self.store.topic_count());
        self.store.clear_dirty();
        self.pending_consistency = Consistency::WEAKEST;
        self.state = UpdaterState::Updating;

        debug!(
            node = %self.node,
            ?consistency,
            topics = self.store.topic_count(),
            removing = export.is_none(),
            "Issuing replicated write"
        );

        let (tx, rx) = oneshot::channel();
        let writer = self.writer.clone();
        let node = self.node.clone();
        tokio::spawn(async move {
            let result = match export {
                Some(filter) => writer.put(&node, filter, consistency).await,
                None => writer.remove(&node, consistency).await,
            };
            let _ = tx.send(result);
        });
        self.write_rx = Some(rx);
    }

    fn on_write_complete(&mut self, result: Result<(), ReplicaError>) {
        self.write_rx = None;
        self.state = UpdaterState::Waiting;

        match result {
            Ok(()) => {
                self.metrics.replication_success();
                self.release_acks();
                if let Some(snapshot) = self.pending_snapshot.take() {
                    if self
                        .dispatch
                        .send(DispatchCommand::UpdateSnapshot(snapshot))
                        .is_err()
                    {
                        debug!(node = %self.node, "Dispatch actor gone, snapshot dropped");
                    }
                }
                info!(node = %self.node, "Replicated write confirmed");
            }
            Err(error) => {
                self.metrics.replication_failure();
                // Keep acknowledgements queued; re-mark dirty so the next
                // tick retries. The requester only sees this through its
                // own ask-timeout.
                self.store.mark_dirty();
                warn!(node = %self.node, %error, "Replicated write failed, retrying next tick");
            }
        }
    }

    fn release_acks(&mut self) {
        for ack in self.await_sub_ack.drain(..) {
            let _ = ack.send(Ok(()));
        }
    }

    fn clear_departed_node(&self, node: NodeAddress) {
        info!(node = %self.node, departed = %node, "Clearing departed node's replicated entry");
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(error) = writer.remove(&node, Consistency::Local).await {
                warn!(departed = %node, %error, "Failed to clear departed node's entry");
            }
        });
    }
}

async fn wait_write(
    rx: &mut Option<oneshot::Receiver<Result<(), ReplicaError>>>,
) -> Result<(), ReplicaError> {
    match rx {
        Some(rx) => match rx.await {
            Ok(result) => result,
            Err(_) => Err(ReplicaError::WriteDropped),
        },
        None => futures::future::pending().await,
    }
}
