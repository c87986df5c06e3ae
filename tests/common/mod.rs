//! Shared multi-node cluster harness for integration tests.
//!
//! Simulates an N-node cluster in one process: every node gets its own
//! actor set, all nodes share a [`MemoryReplica`] pair as the replicated
//! store and a [`ClusterLinks`] registry as the transport seam.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use clustercast::bloom::BloomFilter;
use clustercast::config::PubSubConfig;
use clustercast::messages::{AckLedger, LocalSubscriber, Message, NodeAddress};
use clustercast::metrics::MetricsSink;
use clustercast::node::{ClusterLinks, PubSubHandle, PubSubNode, ReplicaHandles};
use clustercast::replica::memory::MemoryReplica;

/// Tick interval used by harness clusters.
pub const TICK_MS: u64 = 25;

/// Configuration tuned for fast, deterministic tests.
pub fn test_config() -> PubSubConfig {
    PubSubConfig {
        update_interval_ms: TICK_MS,
        force_update_probability: 0.0,
        restart_delay_ms: 200,
        ..Default::default()
    }
}

/// Metrics sink counting the events the tests assert on.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub dead_letters: AtomicUsize,
    pub false_positives: AtomicUsize,
    pub restarts: AtomicUsize,
}

impl MetricsSink for CountingMetrics {
    fn false_positive(&self) {
        self.false_positives.fetch_add(1, Ordering::SeqCst);
    }

    fn dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::SeqCst);
    }

    fn child_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestCluster {
    pub links: Arc<ClusterLinks>,
    pub topic_replica: MemoryReplica<BloomFilter>,
    pub ack_replica: MemoryReplica<AckLedger>,
    pub metrics: Arc<CountingMetrics>,
    config: PubSubConfig,
    nodes: Vec<PubSubNode>,
}

impl TestCluster {
    pub async fn start(size: usize) -> Self {
        Self::start_with_config(size, test_config()).await
    }

    pub async fn start_with_config(size: usize, config: PubSubConfig) -> Self {
        let links = ClusterLinks::new();
        let topic_replica: MemoryReplica<BloomFilter> = MemoryReplica::new();
        let ack_replica: MemoryReplica<AckLedger> = MemoryReplica::new();
        let metrics = Arc::new(CountingMetrics::default());

        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let node = PubSubNode::start(
                NodeAddress::new(format!("node-{i}")),
                config.clone(),
                ReplicaHandles {
                    topic_writer: Arc::new(topic_replica.clone()),
                    topic_reader: Arc::new(topic_replica.clone()),
                    ack_writer: Arc::new(ack_replica.clone()),
                    ack_reader: Arc::new(ack_replica.clone()),
                },
                links.clone(),
                metrics.clone(),
            )
            .expect("node start");
            nodes.push(node);
        }

        // Let every node's children come up and register their links.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            links,
            topic_replica,
            ack_replica,
            metrics,
            config,
            nodes,
        }
    }

    pub fn handle(&self, index: usize) -> PubSubHandle {
        self.nodes[index].handle()
    }

    pub fn address(&self, index: usize) -> NodeAddress {
        self.nodes[index].address().clone()
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Wait long enough for every node to tick and replicate a few times.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.update_interval_ms * 5)).await;
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

/// A fresh subscriber mailbox pair.
pub fn mailbox() -> (LocalSubscriber, mpsc::UnboundedReceiver<Arc<Message>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LocalSubscriber::new(tx), rx)
}

pub fn topics(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn message(topic_names: &[&str], body: &str) -> Message {
    Message::new(topic_names.iter().copied(), Bytes::from(body.to_string()))
}

/// Receive with a timeout; `None` means nothing arrived in time.
pub async fn recv_within(
    rx: &mut mpsc::UnboundedReceiver<Arc<Message>>,
    timeout: Duration,
) -> Option<Arc<Message>> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Assert silence on a mailbox for the given window.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Arc<Message>>, window: Duration) {
    assert!(
        recv_within(rx, window).await.is_none(),
        "expected no delivery"
    );
}
