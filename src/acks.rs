//! Acknowledgement-label registry actor.
//!
//! Guards cluster-wide uniqueness of declared acknowledgement labels. A
//! declaration is checked against both the local pending declarations and
//! the latest replicated remote view before acceptance; accepted
//! declarations are flushed periodically onto the literal replicated
//! collection with the same single-in-flight-write discipline as the
//! subscription updater. Labels ride the exact collection because
//! duplicate detection cannot tolerate Bloom false positives.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::PubSubConfig;
use crate::dispatch::DispatchCommand;
use crate::error::{PubSubError, ReplicaError};
use crate::messages::{
    AckDeclaration, AckLedger, Consistency, LocalSubscriber, NodeAddress, SubscriberRef,
};
use crate::metrics::MetricsSink;
use crate::replica::{ReplicaEvent, ReplicaReader, ReplicaWriter};

/// Commands accepted by the registry.
pub enum AckCommand {
    /// Declare exclusive (or group-shared) ownership of a label set.
    Declare {
        subscriber: LocalSubscriber,
        group: Option<String>,
        labels: BTreeSet<String>,
        reply: oneshot::Sender<Result<(), PubSubError>>,
    },
    /// A node left the cluster; delete its replicated declarations.
    NodeRemoved { node: NodeAddress },
    /// Stop immediately; the supervisor restarts the sibling group.
    Kill,
}

struct LocalDeclaration {
    subscriber: LocalSubscriber,
    group: Option<String>,
    labels: BTreeSet<String>,
}

pub(crate) struct AckRegistry {
    node: NodeAddress,
    config: PubSubConfig,
    commands: mpsc::UnboundedReceiver<AckCommand>,
    dispatch: mpsc::UnboundedSender<DispatchCommand>,
    writer: Arc<dyn ReplicaWriter<AckLedger>>,
    reader: Arc<dyn ReplicaReader<AckLedger>>,
    metrics: Arc<dyn MetricsSink>,

    declarations: Vec<LocalDeclaration>,
    /// Cached view of other nodes' ledgers; own entries are excluded.
    remote: BTreeMap<NodeAddress, AckLedger>,
    dirty: bool,
    updating: bool,
    write_rx: Option<oneshot::Receiver<Result<(), ReplicaError>>>,
}

impl AckRegistry {
    pub(crate) fn new(
        node: NodeAddress,
        config: PubSubConfig,
        commands: mpsc::UnboundedReceiver<AckCommand>,
        dispatch: mpsc::UnboundedSender<DispatchCommand>,
        writer: Arc<dyn ReplicaWriter<AckLedger>>,
        reader: Arc<dyn ReplicaReader<AckLedger>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            node,
            config,
            commands,
            dispatch,
            writer,
            reader,
            metrics,
            declarations: Vec::new(),
            remote: BTreeMap::new(),
            dirty: false,
            updating: false,
            write_rx: None,
        }
    }

    pub(crate) async fn run(mut self) {
        // Fresh registry, fresh truth: the first tick replaces (or clears)
        // any entry a predecessor left replicated.
        self.dirty = true;

        // Subscribe to changes before the initial load; events arriving in
        // between stay buffered instead of being lost.
        let mut changes = self.reader.changes();
        let mut merged = self.reader.merged().await;
        merged.remove(&self.node);
        self.remote = merged;
        let mut ticker = tokio::time::interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let write_in_flight = self.write_rx.is_some();
            tokio::select! {
                maybe_command = self.commands.recv() => match maybe_command {
                    Some(AckCommand::Declare { subscriber, group, labels, reply }) => {
                        let result = self.declare(subscriber, group, labels);
                        let _ = reply.send(result);
                    }
                    Some(AckCommand::NodeRemoved { node }) => self.clear_departed_node(node),
                    Some(AckCommand::Kill) => {
                        warn!(node = %self.node, "Ack registry killed");
                        return;
                    }
                    None => return,
                },
                _ = ticker.tick() => self.on_tick(),
                result = wait_write(&mut self.write_rx), if write_in_flight => {
                    self.on_write_complete(result);
                }
                event = changes.recv() => match event {
                    Ok(event) => self.on_replica_event(event),
                    Err(reason) => {
                        debug!(node = %self.node, %reason, "Reloading remote declaration view");
                        let mut merged = self.reader.merged().await;
                        merged.remove(&self.node);
                        self.remote = merged;
                        changes = self.reader.changes();
                    }
                },
            }
        }
    }

    fn declare(
        &mut self,
        subscriber: LocalSubscriber,
        group: Option<String>,
        labels: BTreeSet<String>,
    ) -> Result<(), PubSubError> {
        if labels.is_empty() {
            return Err(PubSubError::EmptyLabelSet);
        }

        // Local pending declarations first, then the latest remote view.
        let local = self
            .declarations
            .iter()
            .map(|declaration| (&declaration.group, &declaration.labels));
        if let Some(conflict) = find_conflict(&group, &labels, local) {
            return Err(conflict);
        }

        // Folding in ascending node-address order keeps the verdict
        // consistent with the publisher-side first-writer-wins index.
        let remote = self
            .remote
            .values()
            .flat_map(|ledger| ledger.declarations.iter())
            .map(|declaration| (&declaration.group, &declaration.labels));
        if let Some(conflict) = find_conflict(&group, &labels, remote) {
            return Err(conflict);
        }

        info!(
            node = %self.node,
            subscriber = %subscriber.id,
            group = group.as_deref().unwrap_or("<none>"),
            ?labels,
            "Ack labels declared"
        );
        self.declarations.push(LocalDeclaration {
            subscriber,
            group,
            labels,
        });
        self.dirty = true;
        Ok(())
    }

    fn on_tick(&mut self) {
        let before = self.declarations.len();
        self.declarations
            .retain(|declaration| !declaration.subscriber.is_closed());
        if self.declarations.len() != before {
            debug!(
                node = %self.node,
                swept = before - self.declarations.len(),
                "Swept terminated declarers"
            );
            self.dirty = true;
        }

        if self.updating || !self.dirty {
            return;
        }
        self.issue_write();
    }

    fn issue_write(&mut self) {
        let export = (!self.declarations.is_empty()).then(|| AckLedger {
            declarations: self
                .declarations
                .iter()
                .map(|declaration| AckDeclaration {
                    subscriber: SubscriberRef {
                        node: self.node.clone(),
                        id: declaration.subscriber.id,
                    },
                    group: declaration.group.clone(),
                    labels: declaration.labels.clone(),
                })
                .collect(),
        });

        self.dirty = false;
        self.updating = true;
        trace!(
            node = %self.node,
            declarations = self.declarations.len(),
            removing = export.is_none(),
            "Flushing declarations"
        );

        let (tx, rx) = oneshot::channel();
        let writer = self.writer.clone();
        let node = self.node.clone();
        tokio::spawn(async move {
            let result = match export {
                Some(ledger) => writer.put(&node, ledger, Consistency::Local).await,
                None => writer.remove(&node, Consistency::Local).await,
            };
            let _ = tx.send(result);
        });
        self.write_rx = Some(rx);
    }

    fn on_write_complete(&mut self, result: Result<(), ReplicaError>) {
        self.write_rx = None;
        self.updating = false;

        match result {
            Ok(()) => {
                self.metrics.replication_success();
                // Targeted deliveries resolve declarers at the dispatch
                // actor; give it the confirmed set.
                let declarers = self
                    .declarations
                    .iter()
                    .map(|declaration| declaration.subscriber.clone())
                    .collect();
                if self
                    .dispatch
                    .send(DispatchCommand::UpdateDeclarers(declarers))
                    .is_err()
                {
                    debug!(node = %self.node, "Dispatch actor gone, declarer set dropped");
                }
            }
            Err(error) => {
                self.metrics.replication_failure();
                self.dirty = true;
                warn!(node = %self.node, %error, "Declaration flush failed, retrying next tick");
            }
        }
    }

    fn on_replica_event(&mut self, event: ReplicaEvent<AckLedger>) {
        match event {
            ReplicaEvent::Updated { node, value } if node != self.node => {
                self.remote.insert(node, value);
            }
            ReplicaEvent::Removed { node } if node != self.node => {
                self.remote.remove(&node);
            }
            // Own writes echo back through the store; the local list is
            // already authoritative for this node.
            _ => {}
        }
    }

    fn clear_departed_node(&mut self, node: NodeAddress) {
        self.remote.remove(&node);
        info!(node = %self.node, departed = %node, "Clearing departed node's declarations");
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(error) = writer.remove(&node, Consistency::Local).await {
                warn!(departed = %node, %error, "Failed to clear departed node's declarations");
            }
        });
    }
}

/// First conflicting declaration, if any.
///
/// A declaration joins an existing group only with an identical label set;
/// outside an identical group, any label overlap is a uniqueness violation.
fn find_conflict<'a>(
    group: &Option<String>,
    labels: &BTreeSet<String>,
    existing: impl Iterator<Item = (&'a Option<String>, &'a BTreeSet<String>)>,
) -> Option<PubSubError> {
    for (declared_group, declared_labels) in existing {
        let same_group = group.is_some() && group == declared_group;
        if same_group {
            if declared_labels != labels {
                return Some(PubSubError::GroupConflict {
                    group: group.clone().unwrap_or_default(),
                });
            }
        } else if let Some(label) = labels.intersection(declared_labels).next() {
            return Some(PubSubError::AckLabelConflict {
                label: label.clone(),
            });
        }
    }
    None
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;
    use crate::replica::memory::MemoryReplica;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn test_config() -> PubSubConfig {
        PubSubConfig {
            update_interval_ms: 20,
            ..Default::default()
        }
    }

    fn spawn_registry(
        node: &str,
        replica: &MemoryReplica<AckLedger>,
    ) -> mpsc::UnboundedSender<AckCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        // Drain declarer pushes so the channel never looks closed.
        tokio::spawn(async move { while dispatch_rx.recv().await.is_some() {} });
        let registry = AckRegistry::new(
            NodeAddress::new(node),
            test_config(),
            rx,
            dispatch_tx,
            Arc::new(replica.clone()),
            Arc::new(replica.clone()),
            crate::metrics::noop(),
        );
        tokio::spawn(registry.run());
        tx
    }

    fn subscriber() -> (LocalSubscriber, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalSubscriber::new(tx), rx)
    }

    fn labels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn declare(
        registry: &mpsc::UnboundedSender<AckCommand>,
        subscriber: LocalSubscriber,
        group: Option<&str>,
        label_names: &[&str],
    ) -> Result<(), PubSubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        registry
            .send(AckCommand::Declare {
                subscriber,
                group: group.map(|g| g.to_string()),
                labels: labels(label_names),
                reply: reply_tx,
            })
            .unwrap();
        reply_rx.await.unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn test_overlapping_labels_rejected_locally() {
        let replica: MemoryReplica<AckLedger> = MemoryReplica::new();
        let registry = spawn_registry("node-a", &replica);
        let (first, _first_rx) = subscriber();
        let (second, _second_rx) = subscriber();

        assert!(declare(&registry, first, None, &["receipt"]).await.is_ok());

        let conflict = declare(&registry, second, None, &["receipt", "extra"]).await;
        assert!(matches!(
            conflict,
            Err(PubSubError::AckLabelConflict { label }) if label == "receipt"
        ));
    }

    #[tokio::test]
    async fn test_identical_group_shares_labels() {
        let replica: MemoryReplica<AckLedger> = MemoryReplica::new();
        let registry = spawn_registry("node-a", &replica);
        let (first, _first_rx) = subscriber();
        let (second, _second_rx) = subscriber();
        let (third, _third_rx) = subscriber();

        tokio_test::assert_ok!(declare(&registry, first, Some("workers"), &["done"]).await);
        tokio_test::assert_ok!(declare(&registry, second, Some("workers"), &["done"]).await);

        // Same group, different labels: rejected.
        let conflict = declare(&registry, third, Some("workers"), &["other"]).await;
        assert!(matches!(conflict, Err(PubSubError::GroupConflict { .. })));
    }

    #[tokio::test]
    async fn test_empty_label_set_rejected() {
        let replica: MemoryReplica<AckLedger> = MemoryReplica::new();
        let registry = spawn_registry("node-a", &replica);
        let (sub, _rx) = subscriber();

        let result = declare(&registry, sub, None, &[]).await;
        assert!(matches!(result, Err(PubSubError::EmptyLabelSet)));
    }

    #[tokio::test]
    async fn test_remote_declaration_blocks_duplicate() {
        let replica: MemoryReplica<AckLedger> = MemoryReplica::new();
        let registry_a = spawn_registry("node-a", &replica);
        let registry_b = spawn_registry("node-b", &replica);
        let (on_a, _a_rx) = subscriber();
        let (on_b, _b_rx) = subscriber();

        assert!(declare(&registry_a, on_a, None, &["receipt"]).await.is_ok());
        // Wait for node-a's flush to replicate and node-b to observe it.
        settle().await;

        let conflict = declare(&registry_b, on_b, None, &["receipt"]).await;
        assert!(matches!(
            conflict,
            Err(PubSubError::AckLabelConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminated_declarer_swept_and_flushed() {
        let replica: MemoryReplica<AckLedger> = MemoryReplica::new();
        let registry = spawn_registry("node-a", &replica);
        let (sub, sub_rx) = subscriber();

        assert!(declare(&registry, sub, None, &["receipt"]).await.is_ok());
        settle().await;
        assert_eq!(replica.merged().await.len(), 1);

        drop(sub_rx);
        settle().await;

        // The node's ledger became empty, so its entry was removed.
        assert!(replica.merged().await.is_empty());

        // The label is free again.
        let (fresh, _fresh_rx) = subscriber();
        assert!(declare(&registry, fresh, None, &["receipt"]).await.is_ok());
    }
}
