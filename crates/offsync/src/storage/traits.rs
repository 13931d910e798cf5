/// Durable local persistence.
///
/// `KvStore` is the narrow byte-level trait implemented by concrete stores
/// (in-memory, SQLite, or a host-provided store). Writes are assumed
/// crash-consistent at the granularity of a single key.
use crate::error::StorageError;

/// String-keyed byte store.
///
/// Implementors must be `Send + Sync` so they can be shared across
/// controllers running on different tasks.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or replace the value stored under `key`.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Every stored key starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
