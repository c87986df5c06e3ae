//! Clustercast - distributed publish/subscribe engine
//!
//! Broker-less pub/sub for a clustered message-routing platform: each node
//! replicates a Bloom-filter index of its local topic subscriptions
//! through a pluggable eventually-consistent store, publishers route
//! against the merged view, and an acknowledgement-label registry keeps
//! named capabilities cluster-unique with deterministic group routing.

pub mod acks;
pub mod bloom;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hashing;
pub mod messages;
pub mod metrics;
pub mod node;
pub mod publisher;
pub mod replica;
pub mod routing;
pub mod store;
pub mod supervisor;
pub mod updater;
