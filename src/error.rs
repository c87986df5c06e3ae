//! Error taxonomy for the pub/sub engine.
//!
//! Replication failures are recovered locally (the updater re-marks its
//! store dirty and retries on the next tick); they only reach a caller
//! through an ask-timeout the caller applies itself. Uniqueness violations
//! and unavailability are surfaced synchronously.

use thiserror::Error;

/// Result type for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors surfaced at the pub/sub boundary.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Children are stopped or mid-restart. Requests fail fast instead of
    /// queueing into a crash loop.
    #[error("Pub/sub unavailable: children are restarting")]
    Unavailable,

    #[error("Acknowledgement label '{label}' is already declared")]
    AckLabelConflict { label: String },

    #[error("Group '{group}' is already declared with a different label set")]
    GroupConflict { group: String },

    #[error("Declaration must carry at least one label")]
    EmptyLabelSet,

    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// Errors from the replicated-data store.
#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    #[error("Replicated write failed: {0}")]
    WriteFailed(String),

    #[error("Replicated store unreachable: {0}")]
    Unreachable(String),

    #[error("Replicated write dropped before completion")]
    WriteDropped,
}
