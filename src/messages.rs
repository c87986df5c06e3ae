//! Boundary types exchanged with the pub/sub engine.
//!
//! Payload bodies are opaque bytes; the engine routes on topic strings,
//! entity identifiers and acknowledgement labels only. Subscriber mailboxes
//! never leave their owning node - only the serializable [`SubscriberRef`]
//! identity is replicated.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque cluster-unique node address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Node-local subscriber identity.
pub type SubscriberId = Uuid;

/// Cluster-wide identity of a subscriber.
///
/// This is what gets replicated; the mailbox stays on the owning node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberRef {
    pub node: NodeAddress,
    pub id: SubscriberId,
}

/// A published message: routing metadata plus an opaque body.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topics this message is tagged with.
    pub topics: BTreeSet<String>,
    /// Entity identifier used for sticky group routing.
    pub entity_id: Option<String>,
    /// Acknowledgement labels this message requests; routes the message
    /// through the group index in addition to topic fan-out.
    pub ack_labels: BTreeSet<String>,
    /// Opaque payload.
    pub body: Bytes,
}

impl Message {
    pub fn new<T, S>(topics: T, body: Bytes) -> Self
    where
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            entity_id: None,
            ack_labels: BTreeSet::new(),
            body,
        }
    }

    /// Set the entity identifier for sticky group routing.
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Request the given acknowledgement labels.
    pub fn with_ack_labels<T, S>(mut self, labels: T) -> Self
    where
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ack_labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// Local filter predicate, evaluated only on the node owning the subscriber.
pub type SubscriberFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// A locally registered subscriber: identity plus mailbox plus optional filter.
#[derive(Clone)]
pub struct LocalSubscriber {
    pub id: SubscriberId,
    mailbox: mpsc::UnboundedSender<Arc<Message>>,
    filter: Option<SubscriberFilter>,
}

impl LocalSubscriber {
    /// Register a mailbox under a fresh identity.
    pub fn new(mailbox: mpsc::UnboundedSender<Arc<Message>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox,
            filter: None,
        }
    }

    /// Attach a local filter predicate.
    pub fn with_filter(mut self, filter: SubscriberFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// The subscriber's mailbox is gone; it counts as terminated.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Evaluate the local filter predicate. A filter rejection is not a
    /// delivery failure; the subscriber exists and simply opted out.
    pub fn matches(&self, message: &Message) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(message))
    }

    /// Hand a message to the mailbox. Returns false when the mailbox is
    /// closed, which callers treat as subscriber termination.
    pub fn deliver(&self, message: Arc<Message>) -> bool {
        self.mailbox.send(message).is_ok()
    }
}

impl fmt::Debug for LocalSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSubscriber")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Required replication acknowledgement strength for a store mutation.
///
/// An updater accumulates the strongest level requested since its last
/// flush, issues the next write at that level, then resets to [`Local`].
///
/// [`Local`]: Consistency::Local
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Acknowledged by the local replica only.
    Local,
    /// Acknowledged by exactly this many replicas.
    Exactly(u32),
    /// Acknowledged by a majority of replicas.
    Majority,
    /// Acknowledged by every replica.
    All,
}

impl Consistency {
    /// The weakest level; what an updater resets to after each flush.
    pub const WEAKEST: Consistency = Consistency::Local;

    /// Conservative strength rank. `Majority` and `All` outrank any
    /// explicit replica count, so escalation never weakens a request.
    fn rank(self) -> (u8, u32) {
        match self {
            Consistency::Local => (0, 0),
            Consistency::Exactly(n) => (1, n),
            Consistency::Majority => (2, 0),
            Consistency::All => (3, 0),
        }
    }

    /// The stronger of two levels.
    pub fn strongest(self, other: Consistency) -> Consistency {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::WEAKEST
    }
}

/// One subscriber's acknowledgement-label declaration, as replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckDeclaration {
    pub subscriber: SubscriberRef,
    /// Group membership; `None` declares exclusive ownership.
    pub group: Option<String>,
    pub labels: BTreeSet<String>,
}

/// A node's full set of declarations, the literal replicated collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckLedger {
    pub declarations: Vec<AckDeclaration>,
}

/// Feedback for a targeted delivery that bounced: the subscriber no longer
/// exists on the node that was supposed to host it.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subscriber: SubscriberRef,
}
