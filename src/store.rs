//! Node-local subscription store.
//!
//! Maps each locally known topic to the local subscribers interested in it.
//! The store is only ever touched by its owning updater task, so mutation
//! is plain synchronous code; concurrency lives a level up.
//!
//! Two exports exist: a Bloom filter over the unioned topic set (replicated
//! for ordinary pub/sub, false positives acceptable) and the literal topic
//! set (used where exactness matters).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::bloom::BloomFilter;
use crate::hashing::HashFamily;
use crate::messages::{LocalSubscriber, Message, SubscriberId};

/// Per-node index of topics to local subscribers.
#[derive(Debug, Default)]
pub struct TopicStore {
    topics: HashMap<String, BTreeSet<SubscriberId>>,
    subscribers: HashMap<SubscriberId, LocalSubscriber>,
    subscriptions: HashMap<SubscriberId, BTreeSet<String>>,
    dirty: bool,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to the given topics. Returns true when the store
    /// changed. Topics across repeated subscriptions of the same subscriber
    /// are unioned.
    pub fn subscribe(&mut self, subscriber: LocalSubscriber, topics: &BTreeSet<String>) -> bool {
        if topics.is_empty() {
            return false;
        }

        let id = subscriber.id;
        let mut changed = false;
        self.subscribers.entry(id).or_insert(subscriber);
        let subscribed = self.subscriptions.entry(id).or_default();

        for topic in topics {
            if subscribed.insert(topic.clone()) {
                changed = true;
            }
            self.topics.entry(topic.clone()).or_default().insert(id);
        }

        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Remove a subscriber from the given topics. Returns true when the
    /// store changed.
    pub fn unsubscribe(&mut self, id: SubscriberId, topics: &BTreeSet<String>) -> bool {
        let mut changed = false;
        for topic in topics {
            if let Some(ids) = self.topics.get_mut(topic) {
                if ids.remove(&id) {
                    changed = true;
                }
                if ids.is_empty() {
                    self.topics.remove(topic);
                }
            }
            if let Some(subscribed) = self.subscriptions.get_mut(&id) {
                subscribed.remove(topic);
            }
        }

        if self
            .subscriptions
            .get(&id)
            .is_some_and(|subscribed| subscribed.is_empty())
        {
            self.subscriptions.remove(&id);
            self.subscribers.remove(&id);
        }

        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Drop a subscriber and all its topics. Returns true when the store
    /// changed.
    pub fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        let Some(subscribed) = self.subscriptions.remove(&id) else {
            return false;
        };
        self.subscribers.remove(&id);

        for topic in subscribed {
            if let Some(ids) = self.topics.get_mut(&topic) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }

        self.dirty = true;
        true
    }

    /// Drop every subscriber whose mailbox has closed. Returns the number
    /// removed. This is the liveness sweep run on each tick.
    pub fn sweep_closed(&mut self) -> usize {
        let closed: Vec<SubscriberId> = self
            .subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.is_closed())
            .map(|(id, _)| *id)
            .collect();

        for id in &closed {
            self.remove_subscriber(*id);
        }
        closed.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Whether local state changed since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force a re-export on the next flush even without local changes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Probabilistic export: the full topic set folded into one Bloom
    /// filter sized for the current topic count.
    pub fn export_filter(
        &self,
        family: &HashFamily,
        expected_topics: usize,
        false_positive_rate: f64,
        buffer_factor: f64,
    ) -> BloomFilter {
        let capacity = self.topics.len().max(expected_topics);
        let mut filter = BloomFilter::sized_for(capacity, false_positive_rate, buffer_factor);
        for topic in self.topics.keys() {
            filter.insert_hashes(&family.hashes(topic));
        }
        filter
    }

    /// Exact export: the literal topic set.
    pub fn export_topics(&self) -> BTreeSet<String> {
        self.topics.keys().cloned().collect()
    }

    /// Immutable snapshot handed to the dispatch actor after each flush.
    pub fn snapshot(&self) -> LocalSnapshot {
        let topics = self
            .topics
            .iter()
            .map(|(topic, ids)| {
                let handles = ids
                    .iter()
                    .filter_map(|id| self.subscribers.get(id).cloned())
                    .collect();
                (topic.clone(), handles)
            })
            .collect();

        LocalSnapshot {
            topics: Arc::new(topics),
            by_id: Arc::new(self.subscribers.clone()),
        }
    }
}

/// Frozen view of the local store, owned by the dispatch actor.
///
/// The exact secondary check against Bloom-filter false positives runs on
/// this snapshot, as does local delivery.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    topics: Arc<HashMap<String, Vec<LocalSubscriber>>>,
    by_id: Arc<HashMap<SubscriberId, LocalSubscriber>>,
}

impl LocalSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// All distinct local subscribers matching any of the message's topics.
    /// Each subscriber appears once even when several topics match.
    pub fn subscribers_for(&self, message: &Message) -> Vec<&LocalSubscriber> {
        let mut seen = BTreeSet::new();
        let mut matched = Vec::new();
        for topic in &message.topics {
            if let Some(handles) = self.topics.get(topic) {
                for subscriber in handles {
                    if seen.insert(subscriber.id) {
                        matched.push(subscriber);
                    }
                }
            }
        }
        matched
    }

    /// Look up a subscriber for a targeted (group-routed) delivery.
    pub fn subscriber(&self, id: SubscriberId) -> Option<&LocalSubscriber> {
        self.by_id.get(&id)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
