//! # Topic Registry
//!
//! Maps exact topics and wildcard patterns to subscriptions.
//!
//! Publish-time matching takes a shared read lock; subscribe/unsubscribe take
//! the exclusive lock. Entries are weak: ownership stays with the
//! subscription manager, and an entry whose subscription is gone simply stops
//! matching.

use crate::subscription::{Subscription, SubscriptionId};
use bus_types::{Topic, TopicPattern};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Debug)]
struct Entry {
    id: SubscriptionId,
    pattern: TopicPattern,
    subscription: Weak<Subscription>,
}

#[derive(Debug, Default)]
struct Index {
    /// Exact topic string to its subscriptions.
    exact: HashMap<String, Vec<Entry>>,
    /// Wildcard patterns, scanned linearly.
    patterns: Vec<Entry>,
}

/// Concurrent topic and pattern index.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    index: RwLock<Index>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a subscription under its pattern.
    pub(crate) fn insert(&self, subscription: &Arc<Subscription>) {
        let entry = Entry {
            id: subscription.id,
            pattern: subscription.pattern.clone(),
            subscription: Arc::downgrade(subscription),
        };

        let mut index = self.index.write();
        if entry.pattern.is_exact() {
            index
                .exact
                .entry(entry.pattern.as_str().to_string())
                .or_default()
                .push(entry);
        } else {
            index.patterns.push(entry);
        }
    }

    /// Remove a subscription. Returns false when it was not indexed.
    pub(crate) fn remove(&self, id: SubscriptionId, pattern: &TopicPattern) -> bool {
        let mut index = self.index.write();
        if pattern.is_exact() {
            let Some(entries) = index.exact.get_mut(pattern.as_str()) else {
                return false;
            };
            let before = entries.len();
            entries.retain(|e| e.id != id);
            let removed = entries.len() != before;
            if entries.is_empty() {
                index.exact.remove(pattern.as_str());
            }
            removed
        } else {
            let before = index.patterns.len();
            index.patterns.retain(|e| e.id != id);
            index.patterns.len() != before
        }
    }

    /// Subscriptions matching `topic`, ordered by subscription id.
    ///
    /// Each subscription appears at most once. An exact and a pattern
    /// subscription are distinct subscriptions and both appear.
    pub fn matches(&self, topic: &Topic) -> Vec<Arc<Subscription>> {
        let index = self.index.read();

        let exact = index
            .exact
            .get(topic.as_str())
            .into_iter()
            .flatten()
            .filter_map(|e| e.subscription.upgrade());
        let wildcard = index
            .patterns
            .iter()
            .filter(|e| e.pattern.matches(topic))
            .filter_map(|e| e.subscription.upgrade());

        let mut matched: Vec<Arc<Subscription>> = exact.chain(wildcard).collect();
        drop(index);

        matched.sort_by_key(|s| s.id);
        matched.dedup_by_key(|s| s.id);
        trace!(topic = %topic, matched = matched.len(), "Matched subscriptions");
        matched
    }

    /// Distinct topics and patterns with at least one subscription, sorted.
    ///
    /// Bus-internal reply topics never appear.
    pub fn topics(&self) -> Vec<String> {
        let index = self.index.read();
        let topics: BTreeSet<String> = index
            .exact
            .keys()
            .cloned()
            .chain(index.patterns.iter().map(|e| e.pattern.as_str().to_string()))
            .collect();
        topics.into_iter().collect()
    }

    /// Subscriptions registered under exactly this topic or pattern string.
    pub fn registered_count(&self, pattern: &str) -> usize {
        let index = self.index.read();
        let exact = index.exact.get(pattern).map_or(0, Vec::len);
        let wildcard = index
            .patterns
            .iter()
            .filter(|e| e.pattern.as_str() == pattern)
            .count();
        exact + wildcard
    }

    /// Total number of indexed entries.
    pub fn len(&self) -> usize {
        let index = self.index.read();
        index.exact.values().map(Vec::len).sum::<usize>() + index.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
