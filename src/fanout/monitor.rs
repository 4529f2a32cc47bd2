//! Monitor Registry
//!
//! Bidirectional index between storage keys and the clients watching them.
//! Both directions are only ever mutated together, inside one write lock,
//! so `client ∈ watchers_of(key)` holds exactly when `key ∈ keys_of(client)`.

use bytes::Bytes;
use parking_lot::RwLock;
use hashbrown::HashMap;

use crate::client::ClientId;

#[derive(Debug, Default)]
struct Index {
    by_key: HashMap<Bytes, HashMap<ClientId, Option<String>>>,
    by_client: HashMap<ClientId, HashMap<Bytes, Option<String>>>,
}

impl Index {
    fn remove(&mut self, client: ClientId, key: &Bytes) -> bool {
        let removed = match self.by_key.get_mut(key) {
            Some(watchers) => {
                let removed = watchers.remove(&client).is_some();
                if watchers.is_empty() {
                    self.by_key.remove(key);
                }
                removed
            }
            None => false,
        };
        if let Some(keys) = self.by_client.get_mut(&client) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_client.remove(&client);
            }
        }
        removed
    }
}

/// Key ↔ client registry with optional per-entry labels
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    index: RwLock<Index>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` on `key`; re-adding replaces the label
    pub fn add(&self, client: ClientId, key: Bytes, label: Option<String>) {
        let mut index = self.index.write();
        index
            .by_key
            .entry(key.clone())
            .or_default()
            .insert(client, label.clone());
        index.by_client.entry(client).or_default().insert(key, label);
    }

    /// Returns false if the client was not registered on `key`
    pub fn remove(&self, client: ClientId, key: &Bytes) -> bool {
        self.index.write().remove(client, key)
    }

    /// Labels registered on `key`
    pub fn members_of(&self, key: &Bytes) -> Vec<String> {
        let index = self.index.read();
        let mut labels: Vec<String> = index
            .by_key
            .get(key)
            .map(|w| w.values().flatten().cloned().collect())
            .unwrap_or_default();
        labels.sort();
        labels
    }

    pub fn cardinality_of(&self, key: &Bytes) -> usize {
        self.index.read().by_key.get(key).map_or(0, HashMap::len)
    }

    pub fn watchers_of(&self, key: &Bytes) -> Vec<ClientId> {
        self.index
            .read()
            .by_key
            .get(key)
            .map(|w| w.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn keys_of(&self, client: ClientId) -> Vec<(Bytes, Option<String>)> {
        self.index
            .read()
            .by_client
            .get(&client)
            .map(|k| k.iter().map(|(key, label)| (key.clone(), label.clone())).collect())
            .unwrap_or_default()
    }

    /// Drop every entry of `client` and return what was removed. A second
    /// call returns nothing.
    pub fn cleanup_client(&self, client: ClientId) -> Vec<(Bytes, Option<String>)> {
        let mut index = self.index.write();
        let Some(keys) = index.by_client.remove(&client) else {
            return Vec::new();
        };
        for key in keys.keys() {
            if let Some(watchers) = index.by_key.get_mut(key) {
                watchers.remove(&client);
                if watchers.is_empty() {
                    index.by_key.remove(key);
                }
            }
        }
        keys.into_iter().collect()
    }

    pub fn key_count(&self) -> usize {
        self.index.read().by_key.len()
    }

    pub fn client_count(&self) -> usize {
        self.index.read().by_client.len()
    }

    /// Checks the two directions agree; used by tests
    pub fn is_consistent(&self) -> bool {
        let index = self.index.read();
        let forward = index.by_key.iter().all(|(key, watchers)| {
            !watchers.is_empty()
                && watchers.iter().all(|(client, label)| {
                    index.by_client.get(client).and_then(|k| k.get(key)) == Some(label)
                })
        });
        let backward = index.by_client.iter().all(|(client, keys)| {
            !keys.is_empty()
                && keys.iter().all(|(key, label)| {
                    index.by_key.get(key).and_then(|w| w.get(client)) == Some(label)
                })
        });
        forward && backward
    }
}
