use std::collections::{HashMap, HashSet};

use crate::envelope::RequestId;
use crate::ids::ConnectionId;

/// A subscription's identity within a shard: `(connection, request id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub connection_id: ConnectionId,
    pub request_id: RequestId,
}

impl SubscriptionKey {
    pub fn new(connection_id: ConnectionId, request_id: RequestId) -> Self {
        Self {
            connection_id,
            request_id,
        }
    }
}

/// Bidirectional subscription index of one shard.
///
/// `by_key` and `by_topic` always mirror each other; every mutation goes
/// through methods that update both.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_key: HashMap<SubscriptionKey, String>,
    by_topic: HashMap<String, HashSet<SubscriptionKey>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `topic`. A previous binding for `key` is removed first
    /// and its topic returned.
    pub fn insert(&mut self, key: SubscriptionKey, topic: String) -> Option<String> {
        let previous = self.remove(&key);
        self.by_topic
            .entry(topic.clone())
            .or_default()
            .insert(key.clone());
        self.by_key.insert(key, topic);
        previous
    }

    /// Remove the binding for `key`, returning its topic.
    pub fn remove(&mut self, key: &SubscriptionKey) -> Option<String> {
        let topic = self.by_key.remove(key)?;
        self.unlink(&topic, key);
        Some(topic)
    }

    /// Remove every binding owned by `connection_id`. Returns how many.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> usize {
        let owned: Vec<SubscriptionKey> = self
            .by_key
            .keys()
            .filter(|key| key.connection_id == connection_id)
            .cloned()
            .collect();
        for key in &owned {
            self.remove(key);
        }
        owned.len()
    }

    /// Subscribers of `topic`, in no particular order.
    pub fn subscribers(&self, topic: &str) -> Vec<SubscriptionKey> {
        self.by_topic
            .get(topic)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_of(&self, key: &SubscriptionKey) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    fn unlink(&mut self, topic: &str, key: &SubscriptionKey) {
        if let Some(keys) = self.by_topic.get_mut(topic) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_topic.remove(topic);
            }
        }
    }

    /// Both directions hold exactly the same bindings.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let forward = self
            .by_key
            .iter()
            .all(|(key, topic)| self.by_topic.get(topic).is_some_and(|keys| keys.contains(key)));
        let backward = self.by_topic.iter().all(|(topic, keys)| {
            !keys.is_empty()
                && keys
                    .iter()
                    .all(|key| self.by_key.get(key).is_some_and(|t| t == topic))
        });
        forward && backward
    }

    #[cfg(test)]
    pub(crate) fn references(&self, connection_id: ConnectionId) -> bool {
        self.by_key.keys().any(|key| key.connection_id == connection_id)
            || self
                .by_topic
                .values()
                .flatten()
                .any(|key| key.connection_id == connection_id)
    }
}
