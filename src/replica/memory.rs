//! In-memory replicated collection.
//!
//! Backs standalone single-process deployments and the multi-node test
//! harness: every simulated node holds a clone of the same `MemoryReplica`,
//! which makes the store trivially convergent while keeping the reader and
//! writer contracts honest (asynchronous completion, change notifications,
//! optional visibility delay).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{ReplicaEvent, ReplicaReader, ReplicaWriter, Result};
use crate::messages::{Consistency, NodeAddress};

/// Capacity of the change-notification channel.
const EVENT_CAPACITY: usize = 256;

/// Record of one write, kept for introspection in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub node: NodeAddress,
    pub consistency: Consistency,
    /// False for removals.
    pub is_put: bool,
}

/// Shared in-memory replicated map with last-writer-wins entries.
pub struct MemoryReplica<T> {
    entries: Arc<RwLock<BTreeMap<NodeAddress, T>>>,
    events: broadcast::Sender<ReplicaEvent<T>>,
    writes: Arc<RwLock<Vec<WriteRecord>>>,
    /// Artificial replication latency, to make eventual consistency
    /// observable in tests.
    delay: Option<Duration>,
}

impl<T> MemoryReplica<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            events,
            writes: Arc::new(RwLock::new(Vec::new())),
            delay: None,
        }
    }

    /// Delay every write's visibility by the given duration.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// All writes issued so far, in order.
    pub async fn write_log(&self) -> Vec<WriteRecord> {
        self.writes.read().await.clone()
    }

    /// The consistency level of the most recent write, if any.
    pub async fn last_write_consistency(&self) -> Option<Consistency> {
        self.writes.read().await.last().map(|w| w.consistency)
    }

    async fn record(&self, node: &NodeAddress, consistency: Consistency, is_put: bool) {
        self.writes.write().await.push(WriteRecord {
            node: node.clone(),
            consistency,
            is_put,
        });
    }
}

impl<T> Default for MemoryReplica<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MemoryReplica<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            events: self.events.clone(),
            writes: self.writes.clone(),
            delay: self.delay,
        }
    }
}

#[async_trait]
impl<T> ReplicaWriter<T> for MemoryReplica<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn put(&self, node: &NodeAddress, value: T, consistency: Consistency) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.entries
            .write()
            .await
            .insert(node.clone(), value.clone());
        self.record(node, consistency, true).await;

        debug!(node = %node, ?consistency, "Replica entry written");
        // No receivers is fine; readers load the merged view on start.
        let _ = self.events.send(ReplicaEvent::Updated {
            node: node.clone(),
            value,
        });
        Ok(())
    }

    async fn remove(&self, node: &NodeAddress, consistency: Consistency) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.entries.write().await.remove(node);
        self.record(node, consistency, false).await;

        debug!(node = %node, ?consistency, "Replica entry removed");
        let _ = self.events.send(ReplicaEvent::Removed { node: node.clone() });
        Ok(())
    }
}

#[async_trait]
impl<T> ReplicaReader<T> for MemoryReplica<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn merged(&self) -> BTreeMap<NodeAddress, T> {
        self.entries.read().await.clone()
    }

    fn changes(&self) -> broadcast::Receiver<ReplicaEvent<T>> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeAddress {
        NodeAddress::new(name)
    }

    #[tokio::test]
    async fn test_put_then_merged_view() {
        let replica: MemoryReplica<u32> = MemoryReplica::new();
        replica.put(&node("a"), 1, Consistency::Local).await.unwrap();
        replica.put(&node("b"), 2, Consistency::Local).await.unwrap();

        let merged = replica.merged().await;
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&node("a")], 1);
    }

    #[tokio::test]
    async fn test_last_writer_wins_per_node() {
        let replica: MemoryReplica<u32> = MemoryReplica::new();
        replica.put(&node("a"), 1, Consistency::Local).await.unwrap();
        replica.put(&node("a"), 7, Consistency::Local).await.unwrap();

        assert_eq!(replica.merged().await[&node("a")], 7);
    }

    #[tokio::test]
    async fn test_remove_deletes_entry_and_notifies() {
        let replica: MemoryReplica<u32> = MemoryReplica::new();
        let mut changes = replica.changes();

        replica.put(&node("a"), 1, Consistency::Local).await.unwrap();
        replica.remove(&node("a"), Consistency::Local).await.unwrap();
        assert!(replica.merged().await.is_empty());

        assert!(matches!(
            changes.recv().await.unwrap(),
            ReplicaEvent::Updated { .. }
        ));
        assert!(matches!(
            changes.recv().await.unwrap(),
            ReplicaEvent::Removed { .. }
        ));
    }

    #[tokio::test]
    async fn test_write_log_records_consistency() {
        let replica: MemoryReplica<u32> = MemoryReplica::new();
        replica
            .put(&node("a"), 1, Consistency::Majority)
            .await
            .unwrap();
        replica.remove(&node("a"), Consistency::Local).await.unwrap();

        let log = replica.write_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].consistency, Consistency::Majority);
        assert!(log[0].is_put);
        assert!(!log[1].is_put);
        assert_eq!(
            replica.last_write_consistency().await,
            Some(Consistency::Local)
        );
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let replica: MemoryReplica<u32> = MemoryReplica::new();
        let peer = replica.clone();
        replica.put(&node("a"), 5, Consistency::Local).await.unwrap();

        assert_eq!(peer.merged().await[&node("a")], 5);
    }
}
