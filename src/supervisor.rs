//! All-for-one supervision of the per-node actor set.
//!
//! If any child stops outside an orderly shutdown, all siblings are
//! stopped and the whole set is restarted together after a configured
//! delay: a partial restart would leave the subscription store and the
//! dispatch actor disagreeing about local state. Requests arriving during
//! the gap are rejected with an unavailable error rather than queued.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};

use crate::acks::{AckCommand, AckRegistry};
use crate::bloom::BloomFilter;
use crate::config::PubSubConfig;
use crate::dispatch::{DispatchActor, DispatchCommand};
use crate::hashing::HashFamily;
use crate::messages::{AckLedger, NodeAddress};
use crate::metrics::MetricsSink;
use crate::node::ClusterLinks;
use crate::publisher::{PublisherActor, PublisherCommand};
use crate::replica::{ReplicaReader, ReplicaWriter};
use crate::updater::{SubscriptionUpdater, UpdaterCommand};

/// Command senders of the currently running child set.
pub(crate) struct ChildHandles {
    pub(crate) updater: mpsc::UnboundedSender<UpdaterCommand>,
    pub(crate) acks: mpsc::UnboundedSender<AckCommand>,
    pub(crate) publisher: mpsc::UnboundedSender<PublisherCommand>,
    pub(crate) dispatch: mpsc::UnboundedSender<DispatchCommand>,
}

/// Swappable child set shared with the facade. `None` while children are
/// down; requests fail fast against it.
pub(crate) type SharedChildren = Arc<RwLock<Option<ChildHandles>>>;

pub(crate) struct Supervisor {
    node: NodeAddress,
    config: PubSubConfig,
    family: Arc<HashFamily>,
    links: Arc<ClusterLinks>,
    topic_writer: Arc<dyn ReplicaWriter<BloomFilter>>,
    topic_reader: Arc<dyn ReplicaReader<BloomFilter>>,
    ack_writer: Arc<dyn ReplicaWriter<AckLedger>>,
    ack_reader: Arc<dyn ReplicaReader<AckLedger>>,
    metrics: Arc<dyn MetricsSink>,
    children: SharedChildren,
    /// Incremented on every (re)start; suffixes child names so a restarted
    /// child never collides with a predecessor that has not fully stopped.
    instance: u64,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: NodeAddress,
        config: PubSubConfig,
        family: Arc<HashFamily>,
        links: Arc<ClusterLinks>,
        topic_writer: Arc<dyn ReplicaWriter<BloomFilter>>,
        topic_reader: Arc<dyn ReplicaReader<BloomFilter>>,
        ack_writer: Arc<dyn ReplicaWriter<AckLedger>>,
        ack_reader: Arc<dyn ReplicaReader<AckLedger>>,
        metrics: Arc<dyn MetricsSink>,
        children: SharedChildren,
    ) -> Self {
        Self {
            node,
            config,
            family,
            links,
            topic_writer,
            topic_reader,
            ack_writer,
            ack_reader,
            metrics,
            children,
            instance: 0,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (handles, mut tasks) = self.start_children().await;
            *self.children.write().await = Some(handles);
            info!(node = %self.node, instance = self.instance, "Pub/sub children started");

            tokio::select! {
                joined = tasks.join_next() => {
                    // Fail fast while siblings are torn down and restarted.
                    *self.children.write().await = None;

                    match joined {
                        Some(Ok(name)) => {
                            error!(node = %self.node, child = name, "Child stopped unexpectedly");
                        }
                        Some(Err(join_error)) if join_error.is_panic() => {
                            error!(node = %self.node, %join_error, "Child panicked");
                        }
                        _ => {
                            error!(node = %self.node, "Child task lost");
                        }
                    }

                    tasks.shutdown().await;
                    self.metrics.child_restart();
                    info!(
                        node = %self.node,
                        delay_ms = self.config.restart_delay_ms,
                        "Restarting all children after delay"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.config.restart_delay()) => {}
                        _ = shutdown.changed() => return,
                    }
                    self.instance += 1;
                }
                _ = shutdown.changed() => {
                    *self.children.write().await = None;
                    tasks.shutdown().await;
                    info!(node = %self.node, "Pub/sub supervisor stopped");
                    return;
                }
            }
        }
    }

    /// Start a fresh child set. Children always begin with empty,
    /// re-initialized state; their first tick re-establishes the node's
    /// replicated entries from that fresh truth.
    async fn start_children(&self) -> (ChildHandles, JoinSet<&'static str>) {
        let instance = self.instance;

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (updater_tx, updater_rx) = mpsc::unbounded_channel();
        let (publisher_tx, publisher_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (dead_letter_tx, dead_letter_rx) = mpsc::unbounded_channel();

        // Peers route to this node through the links registry; re-register
        // so their handles survive the restart.
        self.links
            .register(self.node.clone(), dispatch_tx.clone(), dead_letter_tx)
            .await;

        let mut tasks = JoinSet::new();

        let dispatch = DispatchActor::new(
            self.node.clone(),
            dispatch_rx,
            self.links.clone(),
            self.metrics.clone(),
        );
        tasks.spawn(
            async move {
                dispatch.run().await;
                "dispatch"
            }
            .instrument(info_span!("child", name = %format!("dispatch-{instance}"))),
        );

        let updater = SubscriptionUpdater::new(
            self.node.clone(),
            self.config.clone(),
            self.family.clone(),
            updater_rx,
            dispatch_tx.clone(),
            self.topic_writer.clone(),
            self.metrics.clone(),
        );
        tasks.spawn(
            async move {
                updater.run().await;
                "updater"
            }
            .instrument(info_span!("child", name = %format!("updater-{instance}"))),
        );

        let publisher = PublisherActor::new(
            self.node.clone(),
            publisher_rx,
            dead_letter_rx,
            self.family.clone(),
            self.links.clone(),
            self.topic_reader.clone(),
            self.ack_reader.clone(),
            self.metrics.clone(),
        );
        tasks.spawn(
            async move {
                publisher.run().await;
                "publisher"
            }
            .instrument(info_span!("child", name = %format!("publisher-{instance}"))),
        );

        let acks = AckRegistry::new(
            self.node.clone(),
            self.config.clone(),
            acks_rx,
            dispatch_tx.clone(),
            self.ack_writer.clone(),
            self.ack_reader.clone(),
            self.metrics.clone(),
        );
        tasks.spawn(
            async move {
                acks.run().await;
                "acks"
            }
            .instrument(info_span!("child", name = %format!("acks-{instance}"))),
        );

        let handles = ChildHandles {
            updater: updater_tx,
            acks: acks_tx,
            publisher: publisher_tx,
            dispatch: dispatch_tx,
        };
        (handles, tasks)
    }
}
