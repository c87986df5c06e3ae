//! Per-node facade and the in-cluster links registry.
//!
//! [`PubSubNode`] wires one node's actor set together: it owns the
//! supervisor and exposes the request surface. [`ClusterLinks`] is the
//! transport seam - a registry mapping node addresses to dispatch mailboxes
//! plus a dead-letter channel back to each node's publisher. Wire transport
//! behind that seam is the surrounding runtime's responsibility.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::acks::AckCommand;
use crate::bloom::BloomFilter;
use crate::config::PubSubConfig;
use crate::dispatch::DispatchCommand;
use crate::error::{PubSubError, Result};
use crate::hashing::HashFamily;
use crate::messages::{
    AckLedger, Consistency, DeadLetter, LocalSubscriber, Message, NodeAddress, SubscriberId,
};
use crate::metrics::MetricsSink;
use crate::publisher::PublisherCommand;
use crate::replica::{ReplicaReader, ReplicaWriter};
use crate::supervisor::{SharedChildren, Supervisor};
use crate::updater::UpdaterCommand;

/// Reader/writer pairs for the two replicated collections.
///
/// The Bloom collection carries topic subscriptions (false positives are
/// re-checked exactly at the receiver); the literal collection carries
/// acknowledgement-label declarations, which demand exactness.
pub struct ReplicaHandles {
    pub topic_writer: Arc<dyn ReplicaWriter<BloomFilter>>,
    pub topic_reader: Arc<dyn ReplicaReader<BloomFilter>>,
    pub ack_writer: Arc<dyn ReplicaWriter<AckLedger>>,
    pub ack_reader: Arc<dyn ReplicaReader<AckLedger>>,
}

struct NodeLink {
    dispatch: mpsc::UnboundedSender<DispatchCommand>,
    dead_letters: mpsc::UnboundedSender<DeadLetter>,
}

/// Registry of reachable nodes.
///
/// Each node registers its dispatch mailbox and dead-letter intake here;
/// publishers resolve candidate addresses through it. Entries are
/// re-registered in place when a node's children restart.
#[derive(Default)]
pub struct ClusterLinks {
    nodes: RwLock<BTreeMap<NodeAddress, NodeLink>>,
}

impl ClusterLinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) async fn register(
        &self,
        node: NodeAddress,
        dispatch: mpsc::UnboundedSender<DispatchCommand>,
        dead_letters: mpsc::UnboundedSender<DeadLetter>,
    ) {
        self.nodes.write().await.insert(
            node,
            NodeLink {
                dispatch,
                dead_letters,
            },
        );
    }

    /// Drop a node's link, e.g. when membership reports it removed.
    pub async fn deregister(&self, node: &NodeAddress) {
        self.nodes.write().await.remove(node);
    }

    pub async fn nodes(&self) -> Vec<NodeAddress> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Forward a command to a node's dispatch actor. Returns false when the
    /// node is unknown or its mailbox is closed.
    pub(crate) async fn dispatch(&self, node: &NodeAddress, command: DispatchCommand) -> bool {
        match self.nodes.read().await.get(node) {
            Some(link) => link.dispatch.send(command).is_ok(),
            None => false,
        }
    }

    /// Return a dead letter to a node's publisher. Returns false when the
    /// node is unknown or its intake is closed.
    pub(crate) async fn dead_letter(&self, node: &NodeAddress, dead_letter: DeadLetter) -> bool {
        match self.nodes.read().await.get(node) {
            Some(link) => link.dead_letters.send(dead_letter).is_ok(),
            None => false,
        }
    }
}

/// Request surface of a running node. Cheap to clone.
///
/// Requests fail with [`PubSubError::Unavailable`] while the supervisor is
/// restarting the children, instead of queueing.
#[derive(Clone)]
pub struct PubSubHandle {
    node: NodeAddress,
    children: SharedChildren,
}

impl PubSubHandle {
    /// Subscribe a local mailbox to a set of topics.
    ///
    /// With `acknowledge`, resolves once the subscription has been durably
    /// replicated at the requested consistency (at most one tick plus
    /// replication latency). Callers apply their own ask-timeout.
    pub async fn subscribe(
        &self,
        topics: BTreeSet<String>,
        subscriber: LocalSubscriber,
        consistency: Consistency,
        acknowledge: bool,
    ) -> Result<()> {
        let (ack, ack_rx) = maybe_ack(acknowledge);
        self.send_updater(UpdaterCommand::Subscribe {
            topics,
            subscriber,
            consistency,
            ack,
        })
        .await?;
        await_ack(ack_rx).await
    }

    /// Remove a subscriber from the given topics.
    pub async fn unsubscribe(
        &self,
        topics: BTreeSet<String>,
        subscriber: SubscriberId,
        consistency: Consistency,
        acknowledge: bool,
    ) -> Result<()> {
        let (ack, ack_rx) = maybe_ack(acknowledge);
        self.send_updater(UpdaterCommand::Unsubscribe {
            topics,
            subscriber,
            consistency,
            ack,
        })
        .await?;
        await_ack(ack_rx).await
    }

    /// Remove a subscriber and all its topics.
    pub async fn remove_subscriber(
        &self,
        subscriber: SubscriberId,
        consistency: Consistency,
        acknowledge: bool,
    ) -> Result<()> {
        let (ack, ack_rx) = maybe_ack(acknowledge);
        self.send_updater(UpdaterCommand::RemoveSubscriber {
            subscriber,
            consistency,
            ack,
        })
        .await?;
        await_ack(ack_rx).await
    }

    /// Declare cluster-unique acknowledgement labels, optionally shared
    /// within a group. Resolves immediately with the uniqueness verdict.
    pub async fn declare_ack_labels(
        &self,
        subscriber: LocalSubscriber,
        group: Option<String>,
        labels: BTreeSet<String>,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let guard = self.children.read().await;
            let children = guard.as_ref().ok_or(PubSubError::Unavailable)?;
            children
                .acks
                .send(AckCommand::Declare {
                    subscriber,
                    group,
                    labels,
                    reply: reply_tx,
                })
                .map_err(|_| PubSubError::Unavailable)?;
        }
        reply_rx.await.map_err(|_| PubSubError::Unavailable)?
    }

    /// Publish a message to all matching subscribers across the cluster.
    /// Best-effort fan-out; resolves once the publisher accepted it.
    pub async fn publish(&self, message: Message) -> Result<()> {
        let guard = self.children.read().await;
        let children = guard.as_ref().ok_or(PubSubError::Unavailable)?;
        children
            .publisher
            .send(PublisherCommand::Publish { message })
            .map_err(|_| PubSubError::Unavailable)
    }

    /// Membership intake: a node left the cluster. Clears its replicated
    /// entries at local consistency.
    pub async fn node_removed(&self, node: NodeAddress) -> Result<()> {
        let guard = self.children.read().await;
        let children = guard.as_ref().ok_or(PubSubError::Unavailable)?;
        children
            .updater
            .send(UpdaterCommand::NodeRemoved { node: node.clone() })
            .map_err(|_| PubSubError::Unavailable)?;
        children
            .acks
            .send(AckCommand::NodeRemoved { node })
            .map_err(|_| PubSubError::Unavailable)
    }

    /// Fault injection: stop the dispatch actor. The supervisor notices,
    /// tears down the sibling group and restarts it after the configured
    /// delay.
    pub async fn kill_dispatch(&self) -> Result<()> {
        let guard = self.children.read().await;
        let children = guard.as_ref().ok_or(PubSubError::Unavailable)?;
        children
            .dispatch
            .send(DispatchCommand::Kill)
            .map_err(|_| PubSubError::Unavailable)
    }

    async fn send_updater(&self, command: UpdaterCommand) -> Result<()> {
        let guard = self.children.read().await;
        let children = guard.as_ref().ok_or(PubSubError::Unavailable)?;
        children
            .updater
            .send(command)
            .map_err(|_| PubSubError::Unavailable)
    }
}

fn maybe_ack(
    acknowledge: bool,
) -> (
    Option<crate::updater::AckSender>,
    Option<oneshot::Receiver<Result<()>>>,
) {
    if acknowledge {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

async fn await_ack(ack_rx: Option<oneshot::Receiver<Result<()>>>) -> Result<()> {
    match ack_rx {
        // A dropped acknowledgement means the children went down before
        // the pending flush confirmed.
        Some(rx) => rx.await.map_err(|_| PubSubError::Unavailable)?,
        None => Ok(()),
    }
}

/// One node's pub/sub engine: supervisor, actor set and request surface.
pub struct PubSubNode {
    node: NodeAddress,
    handle: PubSubHandle,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl PubSubNode {
    /// Start the engine for `node`. The supervisor spawns the children
    /// immediately; the returned handle is usable at once.
    pub fn start(
        node: NodeAddress,
        config: PubSubConfig,
        replicas: ReplicaHandles,
        links: Arc<ClusterLinks>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let family = Arc::new(HashFamily::new(&config.seed, config.hash_family_size));
        let children: SharedChildren = Arc::new(RwLock::new(None));

        let supervisor = Supervisor::new(
            node.clone(),
            config,
            family,
            links,
            replicas.topic_writer,
            replicas.topic_reader,
            replicas.ack_writer,
            replicas.ack_reader,
            metrics,
            children.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

        Ok(Self {
            node: node.clone(),
            handle: PubSubHandle { node, children },
            shutdown: shutdown_tx,
            supervisor: supervisor_task,
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.node
    }

    pub fn handle(&self) -> PubSubHandle {
        self.handle.clone()
    }

    /// Stop the supervisor and all children.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(join_error) = self.supervisor.await {
            debug!(node = %self.node, %join_error, "Supervisor join failed during shutdown");
        }
    }
}
