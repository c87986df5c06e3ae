//! Replicated-data abstraction.
//!
//! Two independent replicated collections carry subscription state across
//! the cluster: one of per-node Bloom filters (ordinary topic pub/sub,
//! false positives tolerated) and one of per-node literal declaration sets
//! (acknowledgement labels, where exactness is mandatory). Both follow the
//! same update discipline; only the value type differs.
//!
//! The conflict-resolution algorithm behind these traits is out of scope:
//! any eventually-consistent replicated map with per-key last-writer or
//! merge semantics satisfies the contract. [`memory::MemoryReplica`] is the
//! in-process backend used standalone and in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ReplicaError;
use crate::messages::{Consistency, NodeAddress};

pub mod memory;

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Change notification delivered to replica readers.
#[derive(Debug, Clone)]
pub enum ReplicaEvent<T> {
    /// A node's entry was written.
    Updated { node: NodeAddress, value: T },
    /// A node's entry was deleted.
    Removed { node: NodeAddress },
}

/// Write half of a replicated per-node collection.
///
/// Writes complete asynchronously at the requested consistency; completion
/// (or failure) is delivered back to the issuing actor as a message, never
/// by blocking it.
#[async_trait]
pub trait ReplicaWriter<T>: Send + Sync {
    /// Replace this node's entry.
    async fn put(&self, node: &NodeAddress, value: T, consistency: Consistency) -> Result<()>;

    /// Delete a node's entry cluster-wide.
    async fn remove(&self, node: &NodeAddress, consistency: Consistency) -> Result<()>;
}

/// Read half of a replicated per-node collection.
#[async_trait]
pub trait ReplicaReader<T>: Send + Sync {
    /// Merged current view across all nodes.
    async fn merged(&self) -> BTreeMap<NodeAddress, T>;

    /// Subscribe to change notifications. Receivers that lag re-load via
    /// [`merged`](Self::merged).
    fn changes(&self) -> broadcast::Receiver<ReplicaEvent<T>>;
}
