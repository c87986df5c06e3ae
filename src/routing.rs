//! Publisher-side index over replicated acknowledgement-label declarations.
//!
//! Built by folding the literal replicated collection in ascending node
//! address order, which makes group definitions convergent without a
//! coordinator: the first writer (smallest address) owns a group's label
//! set, and later divergent definitions are ignored everywhere equally.

use std::collections::{BTreeMap, BTreeSet};

use crate::hashing::HashFamily;
use crate::messages::{AckLedger, NodeAddress, SubscriberRef};

/// One ungrouped declaration: the subscriber always receives matching
/// signals.
#[derive(Debug, Clone)]
struct SoloEntry {
    subscriber: SubscriberRef,
    labels: BTreeSet<String>,
}

/// One group: a shared label set and the sorted member list used for
/// sticky selection.
#[derive(Debug, Clone)]
struct GroupEntry {
    labels: BTreeSet<String>,
    /// Sorted; selection is `members[hash(entity) % len]`.
    members: Vec<SubscriberRef>,
}

/// Routing index for acknowledgement-label-bearing signals.
#[derive(Debug, Clone, Default)]
pub struct PublisherIndex {
    solos: Vec<SoloEntry>,
    groups: BTreeMap<String, GroupEntry>,
}

impl PublisherIndex {
    /// Fold the merged replicated view into a routing index.
    pub fn build(view: &BTreeMap<NodeAddress, AckLedger>) -> Self {
        let mut index = PublisherIndex::default();

        // BTreeMap iteration is ascending by node address: first writer wins.
        for ledger in view.values() {
            for declaration in &ledger.declarations {
                match &declaration.group {
                    None => index.solos.push(SoloEntry {
                        subscriber: declaration.subscriber.clone(),
                        labels: declaration.labels.clone(),
                    }),
                    Some(group) => {
                        let entry = index.groups.entry(group.clone()).or_insert_with(|| {
                            GroupEntry {
                                labels: declaration.labels.clone(),
                                members: Vec::new(),
                            }
                        });
                        if entry.labels != declaration.labels {
                            // Divergent definition lost the first-writer race.
                            continue;
                        }
                        if !entry.members.contains(&declaration.subscriber) {
                            entry.members.push(declaration.subscriber.clone());
                        }
                    }
                }
            }
        }

        for entry in index.groups.values_mut() {
            entry.members.sort();
        }
        index
    }

    /// Resolve the targets for a signal requesting the given labels.
    ///
    /// Every ungrouped declarer with an overlapping label set is included.
    /// For each overlapping group, exactly one member is chosen by hashing
    /// the entity identifier over the sorted member list, so the same
    /// entity always lands on the same member while distinct entities
    /// spread across the group.
    pub fn targets_for(
        &self,
        labels: &BTreeSet<String>,
        entity_id: Option<&str>,
        family: &HashFamily,
    ) -> Vec<SubscriberRef> {
        let mut targets = Vec::new();

        for solo in &self.solos {
            if overlaps(&solo.labels, labels) {
                targets.push(solo.subscriber.clone());
            }
        }

        for entry in self.groups.values() {
            if entry.members.is_empty() || !overlaps(&entry.labels, labels) {
                continue;
            }
            let chosen = family.sticky_index(entity_id.unwrap_or(""), entry.members.len());
            targets.push(entry.members[chosen].clone());
        }

        targets.sort();
        targets.dedup();
        targets
    }

    /// Whether the subscriber appears anywhere in the index.
    pub fn contains(&self, subscriber: &SubscriberRef) -> bool {
        self.solos.iter().any(|solo| &solo.subscriber == subscriber)
            || self
                .groups
                .values()
                .any(|entry| entry.members.contains(subscriber))
    }

    /// Drop a subscriber from the cached index. Dead-letter self-healing:
    /// keeps bounced targets out of routing until the next replicated
    /// refresh rebuilds the index.
    pub fn purge(&mut self, subscriber: &SubscriberRef) {
        self.solos.retain(|solo| &solo.subscriber != subscriber);
        for entry in self.groups.values_mut() {
            entry.members.retain(|member| member != subscriber);
        }
        self.groups.retain(|_, entry| !entry.members.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.solos.is_empty() && self.groups.is_empty()
    }
}

fn overlaps(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.intersection(b).next().is_some()
}
