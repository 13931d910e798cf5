//! InMemoryRemote: a scriptable in-process remote store.
//!
//! Applies writes with the same merge-patch semantics as the controllers,
//! so a replayed queue can be compared against optimistic state directly.
//! Outages, injected failures and fetch gating make it usable as a test
//! double for every failure mode the engine handles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::error::{RemoteError, RemoteErrorKind};
use crate::patch;
use crate::types::{CollectionScope, Entity, EntityId, EntityPatch};

use super::{BlobStore, PresignRequest, PresignedUpload, RemoteBackend};

#[derive(Default)]
struct RemoteState {
    collections: HashMap<String, Vec<Entity>>,
    offline: bool,
    fail_next: VecDeque<RemoteError>,
    rejected: HashMap<EntityId, RemoteErrorKind>,
    server_id_families: HashSet<String>,
    batch_supported: bool,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
}

#[derive(Clone)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    fetch_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                batch_supported: true,
                next_id: 1,
                ..RemoteState::default()
            })),
            fetch_gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Assign ids server-side for `family`, ignoring client ids.
    pub fn with_server_ids(self, family: &str) -> Self {
        self.state
            .lock()
            .server_id_families
            .insert(family.to_string());
        self
    }

    /// Toggle support for atomic batch updates.
    pub fn with_batch_support(self, supported: bool) -> Self {
        self.state.lock().batch_supported = supported;
        self
    }

    fn key(scope: &CollectionScope) -> String {
        format!("{}/{}", scope.owner_id, scope.key())
    }

    // -----------------------------------------------------------------------
    // Scripting
    // -----------------------------------------------------------------------

    /// Replace a collection's contents.
    pub fn seed(&self, scope: &CollectionScope, entities: Vec<Entity>) {
        self.state
            .lock()
            .collections
            .insert(Self::key(scope), entities);
    }

    /// Current contents of a collection.
    pub fn entities(&self, scope: &CollectionScope) -> Vec<Entity> {
        self.state
            .lock()
            .collections
            .get(&Self::key(scope))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, scope: &CollectionScope, id: &EntityId) -> Option<Entity> {
        self.entities(scope).into_iter().find(|e| &e.id == id)
    }

    /// While offline every call fails with [`RemoteErrorKind::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail the next call with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().fail_next.push_back(error);
    }

    /// Reject every write targeting `id` until [`Self::accept`] is called.
    pub fn reject(&self, id: impl Into<EntityId>, kind: RemoteErrorKind) {
        self.state.lock().rejected.insert(id.into(), kind);
    }

    pub fn accept(&self, id: &EntityId) {
        self.state.lock().rejected.remove(id);
    }

    /// Hold every `fetch_all` until [`Self::release_fetch`] is called.
    pub fn hold_fetches(&self) {
        *self.fetch_gate.lock() = Some(Arc::new(Notify::new()));
    }

    /// Let one held fetch through and stop holding new ones.
    pub fn release_fetch(&self) {
        if let Some(gate) = self.fetch_gate.lock().take() {
            gate.notify_one();
        }
    }

    /// Number of calls made to `operation` (`"fetch_all"`, `"create"`, ...).
    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Number of write calls of any kind.
    pub fn write_count(&self) -> usize {
        ["create", "update", "delete", "batch_update"]
            .iter()
            .map(|op| self.call_count(op))
            .sum()
    }

    pub fn reset_counts(&self) {
        self.state.lock().calls.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Count the call and return an injected failure, if any.
    fn enter(
        state: &mut RemoteState,
        operation: &'static str,
        targets: &[&EntityId],
    ) -> Result<(), RemoteError> {
        *state.calls.entry(operation).or_insert(0) += 1;
        if state.offline {
            return Err(RemoteError::offline());
        }
        if let Some(e) = state.fail_next.pop_front() {
            return Err(e);
        }
        for id in targets {
            if let Some(kind) = state.rejected.get(*id) {
                return Err(RemoteError::with_kind(
                    format!("write to {id} rejected"),
                    *kind,
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for InMemoryRemote {
    async fn fetch_all(&self, scope: &CollectionScope) -> Result<Vec<Entity>, RemoteError> {
        {
            let mut state = self.state.lock();
            Self::enter(&mut state, "fetch_all", &[])?;
        }
        let gate = self.fetch_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.entities(scope))
    }

    async fn create(
        &self,
        scope: &CollectionScope,
        id: Option<&EntityId>,
        fields: &Map<String, Value>,
    ) -> Result<Entity, RemoteError> {
        let mut state = self.state.lock();
        let targets: Vec<&EntityId> = id.into_iter().collect();
        Self::enter(&mut state, "create", &targets)?;

        let server_assigned = state.server_id_families.contains(&scope.family);
        let id = match id {
            Some(id) if !server_assigned => id.clone(),
            _ => {
                let n = state.next_id;
                state.next_id += 1;
                EntityId::new(format!("srv-{n}"))
            }
        };
        let rows = state.collections.entry(Self::key(scope)).or_default();
        if rows.iter().any(|e| e.id == id) {
            return Err(RemoteError::with_kind(
                format!("duplicate id {id}"),
                RemoteErrorKind::Permanent,
            ));
        }
        let entity = Entity::new(id, fields.clone());
        rows.push(entity.clone());
        Ok(entity)
    }

    async fn update(
        &self,
        scope: &CollectionScope,
        id: &EntityId,
        patch: &Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, "update", &[id])?;
        let rows = state.collections.entry(Self::key(scope)).or_default();
        let Some(row) = rows.iter_mut().find(|e| &e.id == id) else {
            return Err(RemoteError::not_found(&scope.key(), id.as_str()));
        };
        patch::merge_fields(&mut row.fields, patch);
        row.fields.remove("id");
        Ok(())
    }

    async fn delete(&self, scope: &CollectionScope, id: &EntityId) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, "delete", &[id])?;
        let rows = state.collections.entry(Self::key(scope)).or_default();
        let before = rows.len();
        rows.retain(|e| &e.id != id);
        if rows.len() == before {
            return Err(RemoteError::not_found(&scope.key(), id.as_str()));
        }
        Ok(())
    }

    async fn batch_update(
        &self,
        scope: &CollectionScope,
        updates: &[EntityPatch],
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        let targets: Vec<&EntityId> = updates.iter().map(|u| &u.id).collect();
        Self::enter(&mut state, "batch_update", &targets)?;
        if !state.batch_supported {
            return Err(RemoteError::unsupported("batch_update"));
        }
        let rows = state.collections.entry(Self::key(scope)).or_default();
        if let Some(missing) = updates
            .iter()
            .find(|u| !rows.iter().any(|e| e.id == u.id))
        {
            return Err(RemoteError::not_found(&scope.key(), missing.id.as_str()));
        }
        for update in updates {
            if let Some(row) = rows.iter_mut().find(|e| e.id == update.id) {
                patch::merge_fields(&mut row.fields, &update.patch);
            }
        }
        Ok(())
    }
}

// ============================================================================
// InMemoryBlobStore
// ============================================================================

#[derive(Default)]
struct BlobState {
    objects: HashMap<String, (String, Vec<u8>)>,
    offline: bool,
    fail_next: VecDeque<RemoteError>,
    next_key: u64,
}

/// An in-process object store with the same outage controls as
/// [`InMemoryRemote`].
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    state: Arc<Mutex<BlobState>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().fail_next.push_back(error);
    }

    /// Stored bytes and content type, keyed by public URL.
    pub fn object(&self, public_url: &str) -> Option<(String, Vec<u8>)> {
        self.state.lock().objects.get(public_url).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    fn enter(state: &mut BlobState) -> Result<(), RemoteError> {
        if state.offline {
            return Err(RemoteError::offline());
        }
        match state.fail_next.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn presign(&self, request: &PresignRequest) -> Result<PresignedUpload, RemoteError> {
        let mut state = self.state.lock();
        Self::enter(&mut state)?;
        state.next_key += 1;
        let key = format!("{}/{}-{}", request.board_id, state.next_key, request.file_name);
        Ok(PresignedUpload {
            upload_url: format!("memory://upload/{key}"),
            public_url: format!("memory://public/{key}"),
            key,
        })
    }

    async fn put(
        &self,
        upload: &PresignedUpload,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        Self::enter(&mut state)?;
        state.objects.insert(
            upload.public_url.clone(),
            (content_type.to_string(), bytes.to_vec()),
        );
        Ok(())
    }
}
