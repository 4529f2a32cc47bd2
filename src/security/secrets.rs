//! Secret Store
//!
//! Global (cluster-wide) secrets plus secrets scoped to one storage key.

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Secrets {
    global: Vec<Bytes>,
    per_key: HashMap<Bytes, Vec<Bytes>>,
}

/// Authorization material, mutable at runtime through admin commands
#[derive(Debug, Default)]
pub struct SecretStore {
    inner: RwLock<Secrets>,
}

impl SecretStore {
    pub fn new(global: Vec<Bytes>) -> Self {
        Self {
            inner: RwLock::new(Secrets {
                global,
                per_key: HashMap::new(),
            }),
        }
    }

    pub fn global(&self) -> Vec<Bytes> {
        self.inner.read().global.clone()
    }

    pub fn set_global(&self, secrets: Vec<Bytes>) {
        self.inner.write().global = secrets;
    }

    pub fn key_secrets(&self, key: &Bytes) -> Vec<Bytes> {
        self.inner
            .read()
            .per_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the secrets of `key`; an empty list removes the entry
    pub fn set_key_secrets(&self, key: Bytes, secrets: Vec<Bytes>) {
        let mut inner = self.inner.write();
        if secrets.is_empty() {
            inner.per_key.remove(&key);
        } else {
            inner.per_key.insert(key, secrets);
        }
    }

    /// Returns false if the secret was already present
    pub fn add_key_secret(&self, key: Bytes, secret: Bytes) -> bool {
        let mut inner = self.inner.write();
        let secrets = inner.per_key.entry(key).or_default();
        if secrets.contains(&secret) {
            return false;
        }
        secrets.push(secret);
        true
    }

    /// Returns false if the secret was not present
    pub fn remove_key_secret(&self, key: &Bytes, secret: &Bytes) -> bool {
        let mut inner = self.inner.write();
        let Some(secrets) = inner.per_key.get_mut(key) else {
            return false;
        };
        let before = secrets.len();
        secrets.retain(|s| s != secret);
        let removed = secrets.len() != before;
        if secrets.is_empty() {
            inner.per_key.remove(key);
        }
        removed
    }

    /// Secrets to try for `key`: all global ones first, then the key's own
    pub fn candidates(&self, key: &Bytes) -> Vec<Bytes> {
        let inner = self.inner.read();
        let mut out = inner.global.clone();
        if let Some(scoped) = inner.per_key.get(key) {
            out.extend(scoped.iter().cloned());
        }
        out
    }
}
