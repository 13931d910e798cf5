//! Tests for CacheStore: mirror-first reads and best-effort persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use offsync::error::StorageError;
use offsync::storage::{CacheStore, KvStore, MemoryKv};
use offsync::{CacheEnvelope, Entity};
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

/// A store whose writes can be switched off.
#[derive(Default)]
struct FlakyKv {
    inner: MemoryKv,
    fail_writes: AtomicBool,
}

impl KvStore for FlakyKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".into()));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.keys_with_prefix(prefix)
    }
}

fn envelope(titles: &[&str]) -> CacheEnvelope {
    CacheEnvelope::new(
        titles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                serde_json::from_value::<Entity>(json!({ "id": format!("e{i}"), "title": t }))
                    .unwrap()
            })
            .collect(),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn saved_envelope_is_readable_after_restart() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let cache = CacheStore::new(Arc::clone(&kv), "cache");
    assert!(cache.save("boards", envelope(&["a", "b"])));

    let restarted = CacheStore::new(kv, "cache");
    let loaded = restarted.load("boards").unwrap();
    assert_eq!(loaded.entities.len(), 2);
    assert_eq!(loaded.entities[1].get_str("title"), Some("b"));
}

#[test]
fn missing_collection_loads_as_none() {
    let cache = CacheStore::new(Arc::new(MemoryKv::new()), "cache");
    assert!(cache.load("nodes:b1").is_none());
}

#[test]
fn failed_persist_keeps_the_mirror() {
    crate::init_tracing();
    let kv = Arc::new(FlakyKv::default());
    let cache = CacheStore::new(Arc::clone(&kv) as Arc<dyn KvStore>, "cache");
    kv.fail_writes.store(true, Ordering::SeqCst);

    assert!(!cache.save("boards", envelope(&["kept"])));
    let loaded = cache.load("boards").unwrap();
    assert_eq!(loaded.entities[0].get_str("title"), Some("kept"));
    assert!(kv.inner.get("cache:boards").unwrap().is_none());
}

#[test]
fn corrupt_envelope_is_treated_as_absent() {
    crate::init_tracing();
    let kv = Arc::new(MemoryKv::new());
    kv.set("cache:boards", b"{not json").unwrap();
    let cache = CacheStore::new(kv, "cache");
    assert!(cache.load("boards").is_none());
}

#[test]
fn evict_drops_mirror_and_store() {
    let kv = Arc::new(MemoryKv::new());
    let cache = CacheStore::new(Arc::clone(&kv) as Arc<dyn KvStore>, "cache");
    cache.save("pages", envelope(&["p"]));
    cache.evict("pages");
    assert!(cache.load("pages").is_none());
    assert!(kv.is_empty());
}

#[test]
fn preload_counts_cached_collections() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    CacheStore::new(Arc::clone(&kv), "cache").save("nodes:b1", envelope(&["n"]));

    let cache = CacheStore::new(kv, "cache");
    assert_eq!(cache.preload(["nodes:b1", "nodes:b2"]), 1);
    assert!(cache.peek("nodes:b1").is_some());
}
