//! Remote backend: the authoritative store each collection converges with.

mod memory;
#[cfg(feature = "http")]
pub mod rest;

pub use memory::{InMemoryBlobStore, InMemoryRemote};
#[cfg(feature = "http")]
pub use rest::{HttpBlobStore, RestBackend, TableMapping};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;
use crate::types::{CollectionScope, Entity, EntityId, EntityPatch};

// ============================================================================
// RemoteBackend: user-provided network layer
// ============================================================================

/// CRUD access to one remote store, addressed by [`CollectionScope`].
///
/// Implementations handle the network (REST, RPC, ...). Every error is
/// returned, never panicked; the engine decides whether it means "queue and
/// retry later".
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Every entity in the collection.
    async fn fetch_all(&self, scope: &CollectionScope) -> Result<Vec<Entity>, RemoteError>;

    /// Insert a new entity. `id` is `None` when the remote assigns ids.
    /// Returns the stored entity, carrying its final id.
    async fn create(
        &self,
        scope: &CollectionScope,
        id: Option<&EntityId>,
        fields: &Map<String, Value>,
    ) -> Result<Entity, RemoteError>;

    /// Apply a JSON merge patch to one entity.
    async fn update(
        &self,
        scope: &CollectionScope,
        id: &EntityId,
        patch: &Map<String, Value>,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, scope: &CollectionScope, id: &EntityId) -> Result<(), RemoteError>;

    /// Apply several patches atomically. Backends without batch support
    /// keep the default, and callers fall back to sequential updates.
    async fn batch_update(
        &self,
        _scope: &CollectionScope,
        _updates: &[EntityPatch],
    ) -> Result<(), RemoteError> {
        Err(RemoteError::unsupported("batch_update"))
    }
}

// ============================================================================
// BlobStore: presigned file uploads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub board_id: String,
    pub file_name: String,
    pub content_type: String,
}

/// Where to send the bytes and where they will be served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub public_url: String,
    pub key: String,
}

/// Two-step object storage: ask for a signed target, then send the bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn presign(&self, request: &PresignRequest) -> Result<PresignedUpload, RemoteError>;

    async fn put(
        &self,
        upload: &PresignedUpload,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<(), RemoteError>;
}
