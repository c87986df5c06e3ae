//! Local dispatch actor.
//!
//! Owns the frozen snapshot of the local subscription store and performs
//! final delivery on this node. Every inbound message - whether published
//! locally or forwarded from a remote publisher that matched this node's
//! Bloom filter - is re-matched here against the exact local index, which
//! is what makes Bloom false positives harmless.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messages::{
    DeadLetter, LocalSubscriber, Message, NodeAddress, SubscriberId, SubscriberRef,
};
use crate::metrics::MetricsSink;
use crate::node::ClusterLinks;
use crate::store::LocalSnapshot;

/// Commands accepted by the dispatch actor.
#[derive(Debug)]
pub enum DispatchCommand {
    /// Replace the local view; pushed by the updater after each confirmed
    /// flush.
    UpdateSnapshot(LocalSnapshot),
    /// Replace the local declarer set; pushed by the ack registry after
    /// each confirmed flush. Group-routed deliveries resolve against this
    /// in addition to the topic snapshot.
    UpdateDeclarers(Vec<LocalSubscriber>),
    /// Topic fan-out delivery: re-match against the exact local index,
    /// then deliver to every matching subscriber.
    Deliver { message: Arc<Message> },
    /// Group-routed delivery addressed to one specific subscriber. Bounces
    /// back to the origin node as a dead letter when the subscriber is
    /// gone.
    DeliverTo {
        target: SubscriberRef,
        message: Arc<Message>,
        origin: NodeAddress,
    },
    /// Stop immediately. The supervisor treats the unexpected stop as a
    /// child failure and restarts the sibling group.
    Kill,
}

pub(crate) struct DispatchActor {
    node: NodeAddress,
    commands: mpsc::UnboundedReceiver<DispatchCommand>,
    links: Arc<ClusterLinks>,
    snapshot: LocalSnapshot,
    declarers: HashMap<SubscriberId, LocalSubscriber>,
    metrics: Arc<dyn MetricsSink>,
}

impl DispatchActor {
    pub(crate) fn new(
        node: NodeAddress,
        commands: mpsc::UnboundedReceiver<DispatchCommand>,
        links: Arc<ClusterLinks>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            node,
            commands,
            links,
            snapshot: LocalSnapshot::empty(),
            declarers: HashMap::new(),
            metrics,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                DispatchCommand::UpdateSnapshot(snapshot) => {
                    trace!(
                        node = %self.node,
                        topics = snapshot.topic_count(),
                        "Local snapshot updated"
                    );
                    self.snapshot = snapshot;
                }
                DispatchCommand::UpdateDeclarers(declarers) => {
                    trace!(
                        node = %self.node,
                        declarers = declarers.len(),
                        "Local declarer set updated"
                    );
                    self.declarers = declarers
                        .into_iter()
                        .map(|subscriber| (subscriber.id, subscriber))
                        .collect();
                }
                DispatchCommand::Deliver { message } => self.deliver(message),
                DispatchCommand::DeliverTo {
                    target,
                    message,
                    origin,
                } => self.deliver_to(target, message, origin).await,
                DispatchCommand::Kill => {
                    warn!(node = %self.node, "Dispatch actor killed");
                    return;
                }
            }
        }
    }

    fn deliver(&self, message: Arc<Message>) {
        let matched = self.snapshot.subscribers_for(&message);
        if matched.is_empty() {
            // The sender's Bloom check said "maybe"; the exact index says no.
            self.metrics.false_positive();
            debug!(node = %self.node, topics = ?message.topics, "No exact match, dropping");
            return;
        }

        self.metrics.true_positive();
        for subscriber in matched {
            if !subscriber.matches(&message) {
                continue;
            }
            if !subscriber.deliver(message.clone()) {
                // Mailbox closed; the updater's next sweep removes it.
                debug!(
                    node = %self.node,
                    subscriber = %subscriber.id,
                    "Dropped delivery to closed mailbox"
                );
            }
        }
    }

    async fn deliver_to(&self, target: SubscriberRef, message: Arc<Message>, origin: NodeAddress) {
        let resolved = self
            .declarers
            .get(&target.id)
            .or_else(|| self.snapshot.subscriber(target.id));
        let delivered = match resolved {
            Some(subscriber) => {
                if subscriber.matches(&message) {
                    subscriber.deliver(message)
                } else {
                    // Filter rejection is the subscriber's choice, not a bounce.
                    true
                }
            }
            None => false,
        };

        if !delivered {
            debug!(
                node = %self.node,
                subscriber = %target.id,
                origin = %origin,
                "Targeted delivery bounced, returning dead letter"
            );
            let bounced = DeadLetter { subscriber: target };
            if !self.links.dead_letter(&origin, bounced).await {
                debug!(origin = %origin, "Origin node unreachable for dead letter");
            }
        }
    }
}
