//! Publisher actor.
//!
//! Routes published messages to candidate nodes using the replicated
//! Bloom-filter view, and ack-label-bearing signals to declared
//! subscribers through the group index. Keeps both replicated views cached
//! and folds change notifications in as they arrive; a publish never waits
//! on the replicated store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bloom::BloomFilter;
use crate::dispatch::DispatchCommand;
use crate::hashing::HashFamily;
use crate::messages::{AckLedger, DeadLetter, Message, NodeAddress};
use crate::metrics::MetricsSink;
use crate::node::ClusterLinks;
use crate::replica::{ReplicaEvent, ReplicaReader};
use crate::routing::PublisherIndex;

/// Commands accepted by the publisher.
#[derive(Debug)]
pub enum PublisherCommand {
    Publish { message: Message },
    /// Stop immediately; the supervisor restarts the sibling group.
    Kill,
}

pub(crate) struct PublisherActor {
    node: NodeAddress,
    commands: mpsc::UnboundedReceiver<PublisherCommand>,
    dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
    family: Arc<HashFamily>,
    links: Arc<ClusterLinks>,
    topic_reader: Arc<dyn ReplicaReader<BloomFilter>>,
    ack_reader: Arc<dyn ReplicaReader<AckLedger>>,
    metrics: Arc<dyn MetricsSink>,

    /// Cached replicated Bloom-filter view, node by node.
    filters: BTreeMap<NodeAddress, BloomFilter>,
    /// Cached literal declaration view and the index derived from it.
    ledgers: BTreeMap<NodeAddress, AckLedger>,
    index: PublisherIndex,
}

impl PublisherActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: NodeAddress,
        commands: mpsc::UnboundedReceiver<PublisherCommand>,
        dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
        family: Arc<HashFamily>,
        links: Arc<ClusterLinks>,
        topic_reader: Arc<dyn ReplicaReader<BloomFilter>>,
        ack_reader: Arc<dyn ReplicaReader<AckLedger>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            node,
            commands,
            dead_letters,
            family,
            links,
            topic_reader,
            ack_reader,
            metrics,
            filters: BTreeMap::new(),
            ledgers: BTreeMap::new(),
            index: PublisherIndex::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        // Subscribe to changes before the initial load; events arriving in
        // between stay buffered instead of being lost.
        let mut topic_changes = self.topic_reader.changes();
        let mut ack_changes = self.ack_reader.changes();

        self.filters = self.topic_reader.merged().await;
        self.ledgers = self.ack_reader.merged().await;
        self.index = PublisherIndex::build(&self.ledgers);

        loop {
            tokio::select! {
                maybe_command = self.commands.recv() => match maybe_command {
                    Some(PublisherCommand::Publish { message }) => self.publish(message).await,
                    Some(PublisherCommand::Kill) => {
                        warn!(node = %self.node, "Publisher killed");
                        return;
                    }
                    None => return,
                },
                maybe_dead_letter = self.dead_letters.recv() => match maybe_dead_letter {
                    Some(dead_letter) => self.on_dead_letter(dead_letter),
                    None => return,
                },
                event = topic_changes.recv() => match event {
                    Ok(ReplicaEvent::Updated { node, value }) => {
                        self.filters.insert(node, value);
                    }
                    Ok(ReplicaEvent::Removed { node }) => {
                        self.filters.remove(&node);
                    }
                    Err(reason) => {
                        // Lagged or closed: re-sync from the merged view.
                        debug!(node = %self.node, %reason, "Reloading Bloom-filter view");
                        self.filters = self.topic_reader.merged().await;
                        topic_changes = self.topic_reader.changes();
                    }
                },
                event = ack_changes.recv() => {
                    match event {
                        Ok(ReplicaEvent::Updated { node, value }) => {
                            self.ledgers.insert(node, value);
                        }
                        Ok(ReplicaEvent::Removed { node }) => {
                            self.ledgers.remove(&node);
                        }
                        Err(reason) => {
                            debug!(node = %self.node, %reason, "Reloading declaration view");
                            self.ledgers = self.ack_reader.merged().await;
                            ack_changes = self.ack_reader.changes();
                        }
                    }
                    self.index = PublisherIndex::build(&self.ledgers);
                },
            }
        }
    }

    #[tracing::instrument(name = "publisher.publish", skip_all, fields(node = %self.node))]
    async fn publish(&mut self, message: Message) {
        let message = Arc::new(message);

        // One hash list per topic; candidates are re-checked exactly at the
        // receiving node, so a false positive only costs one network hop.
        let hashes: Vec<Vec<u64>> = message
            .topics
            .iter()
            .map(|topic| self.family.hashes(topic))
            .collect();
        let candidates = candidate_nodes(&self.filters, &hashes);

        debug!(
            topics = ?message.topics,
            candidates = candidates.len(),
            "Publishing"
        );

        for node in &candidates {
            if !self
                .links
                .dispatch(node, DispatchCommand::Deliver { message: message.clone() })
                .await
            {
                debug!(target_node = %node, "Candidate node unreachable");
            }
        }

        if message.ack_labels.is_empty() {
            return;
        }

        // Targeted routing for signals requesting acknowledgements.
        let targets =
            self.index
                .targets_for(&message.ack_labels, message.entity_id.as_deref(), &self.family);
        for target in targets {
            let sent = self
                .links
                .dispatch(
                    &target.node,
                    DispatchCommand::DeliverTo {
                        target: target.clone(),
                        message: message.clone(),
                        origin: self.node.clone(),
                    },
                )
                .await;
            if !sent {
                // The hosting node is unreachable; same self-healing as a
                // bounced delivery.
                self.on_dead_letter(DeadLetter { subscriber: target });
            }
        }
    }

    fn on_dead_letter(&mut self, dead_letter: DeadLetter) {
        if self.index.contains(&dead_letter.subscriber) {
            info!(
                node = %self.node,
                subscriber = %dead_letter.subscriber.id,
                host = %dead_letter.subscriber.node,
                "Purging vanished remote subscriber from routing index"
            );
            self.metrics.dead_letter();
            self.index.purge(&dead_letter.subscriber);
        } else {
            debug!(
                node = %self.node,
                subscriber = %dead_letter.subscriber.id,
                "Dead letter for unknown subscriber, ignoring"
            );
        }
    }
}

/// Nodes whose replicated filter says "maybe" for at least one topic.
fn candidate_nodes(
    filters: &BTreeMap<NodeAddress, BloomFilter>,
    topic_hashes: &[Vec<u64>],
) -> BTreeSet<NodeAddress> {
    filters
        .iter()
        .filter(|(_, filter)| {
            topic_hashes
                .iter()
                .any(|hashes| filter.might_contain_hashes(hashes))
        })
        .map(|(node, _)| node.clone())
        .collect()
}
