//! CacheStore: the durable cache of each collection's known-good state.
//!
//! One service object is shared by every controller. It owns an in-memory
//! mirror keyed by collection: the persisted form is only consulted when the
//! mirror has nothing for that key, so every read after the first in a
//! process is served without touching the store.
//!
//! Persistence failures are logged and reported as `false`; the mirror keeps
//! the new value either way, so the running process always sees its latest
//! optimistic state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::types::CacheEnvelope;

use super::traits::KvStore;

pub struct CacheStore {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    mirror: Mutex<HashMap<String, CacheEnvelope>>,
}

impl CacheStore {
    pub fn new(kv: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            mirror: Mutex::new(HashMap::new()),
        }
    }

    fn storage_key(&self, collection: &str) -> String {
        format!("{}:{collection}", self.key_prefix)
    }

    /// Load a collection's envelope: mirror first, then the persisted form.
    ///
    /// A persisted value that cannot be decoded is logged and treated as
    /// absent.
    pub fn load(&self, collection: &str) -> Option<CacheEnvelope> {
        if let Some(envelope) = self.mirror.lock().get(collection) {
            return Some(envelope.clone());
        }
        match self.read_persisted(collection) {
            Ok(Some(envelope)) => {
                self.mirror
                    .lock()
                    .entry(collection.to_string())
                    .or_insert_with(|| envelope.clone());
                Some(envelope)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "cache load failed");
                None
            }
        }
    }

    /// Mirror-only read. Never touches the store.
    pub fn peek(&self, collection: &str) -> Option<CacheEnvelope> {
        self.mirror.lock().get(collection).cloned()
    }

    /// Write the mirror, then persist. Returns whether persistence succeeded.
    pub fn save(&self, collection: &str, envelope: CacheEnvelope) -> bool {
        let bytes = serde_json::to_vec(&envelope);
        self.mirror.lock().insert(collection.to_string(), envelope);

        let key = self.storage_key(collection);
        let result = bytes
            .map_err(|source| StorageError::Encode {
                key: key.clone(),
                source,
            })
            .and_then(|bytes| self.kv.set(&key, &bytes));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "cache persist failed");
                false
            }
        }
    }

    /// Warm the mirror for `collections` so a later switch is instant.
    /// Returns how many were found.
    pub fn preload<I, S>(&self, collections: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        collections
            .into_iter()
            .filter(|c| self.load(c.as_ref()).is_some())
            .count()
    }

    /// Drop a collection from the mirror and the store.
    pub fn evict(&self, collection: &str) {
        self.mirror.lock().remove(collection);
        if let Err(e) = self.kv.remove(&self.storage_key(collection)) {
            tracing::warn!(collection = %collection, error = %e, "cache evict failed");
        }
    }

    /// Forget the mirror (simulates a process restart against the same store).
    pub fn clear_mirror(&self) {
        self.mirror.lock().clear();
    }

    fn read_persisted(&self, collection: &str) -> Result<Option<CacheEnvelope>, StorageError> {
        let key = self.storage_key(collection);
        let Some(bytes) = self.kv.get(&key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Corruption { key, source })
    }
}
