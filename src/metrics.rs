//! Metrics sink injected into each component.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction and report
//! through it; implementations decide where the numbers go. Metric names in
//! the doc comments follow the dot-separated convention
//! (`clustercast.<component>.<name>`).

use std::sync::Arc;

/// Receiver for engine counters and gauges.
///
/// Every method has a no-op default so implementations only override what
/// they export.
pub trait MetricsSink: Send + Sync {
    /// Gauge `clustercast.store.topics`: distinct topics in the local store.
    fn topic_count(&self, count: usize) {
        let _ = count;
    }

    /// Counter `clustercast.dispatch.match.true_positive`: remote deliveries
    /// that matched at least one local subscriber.
    fn true_positive(&self) {}

    /// Counter `clustercast.dispatch.match.false_positive`: remote deliveries
    /// the Bloom filter let through but no local subscriber matched.
    fn false_positive(&self) {}

    /// Counter `clustercast.replication.success`: completed replicated writes.
    fn replication_success(&self) {}

    /// Counter `clustercast.replication.failure`: failed replicated writes
    /// (retried on the next tick).
    fn replication_failure(&self) {}

    /// Counter `clustercast.publisher.dead_letter`: bounced targeted
    /// deliveries reported back to a publisher.
    fn dead_letter(&self) {}

    /// Counter `clustercast.supervisor.restart`: all-for-one child restarts.
    fn child_restart(&self) {}
}

/// Sink that drops everything. The default when no exporter is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Convenience constructor for the default sink.
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}
