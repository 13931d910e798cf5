//! Uploads: image files for nodes, held locally while offline.
//!
//! An upload that cannot reach the blob store is written to the key/value
//! store (bytes under `{ns}:blob:{id}`, metadata appended to `{ns}:index`)
//! and replayed in order by [`Uploads::sync_pending`]. Bytes are written
//! before the index entry that points at them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::UploadConfig;
use crate::error::{ControllerError, RemoteError, Result, StorageError};
use crate::remote::{BlobStore, PresignRequest};
use crate::storage::KvStore;
use crate::sync::connectivity::{Connectivity, Drainable};
use crate::sync::executor::DrainReport;
use crate::types::EntityId;

use super::timestamp;

/// An upload waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub id: String,
    pub node_id: String,
    pub board_id: String,
    pub file_name: String,
    pub content_type: String,
    pub size: usize,
    pub queued_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The file is stored remotely and served from `public_url`.
    Uploaded { public_url: String },
    /// The file is held locally until [`Uploads::sync_pending`] succeeds.
    Queued { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSyncReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Entries whose bytes were missing; they are dropped.
    pub discarded: usize,
    pub remaining: usize,
}

/// Clears the syncing flag when the pass ends or is dropped.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type UploadListener = Arc<dyn Fn(&PendingUpload, &str) + Send + Sync>;

pub struct Uploads {
    owner_id: String,
    namespace: String,
    config: UploadConfig,
    kv: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    connectivity: Arc<Connectivity>,
    index_lock: Mutex<()>,
    syncing: AtomicBool,
    listener: Mutex<Option<UploadListener>>,
}

impl Uploads {
    pub fn new(
        owner_id: impl Into<String>,
        namespace: impl Into<String>,
        config: UploadConfig,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            namespace: namespace.into(),
            config,
            kv,
            blobs,
            connectivity,
            index_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Called with each held upload and its public URL once it lands,
    /// including uploads replayed by a regain drain.
    pub fn set_listener(&self, listener: impl Fn(&PendingUpload, &str) + Send + Sync + 'static) {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    /// Reject files the blob store would refuse anyway.
    pub fn validate(&self, content_type: &str, size: usize) -> Result<(), ControllerError> {
        if !self
            .config
            .allowed_content_types
            .iter()
            .any(|t| t == content_type)
        {
            return Err(ControllerError::Validation(format!(
                "unsupported file type {content_type:?}"
            )));
        }
        if size == 0 {
            return Err(ControllerError::Validation("file is empty".into()));
        }
        if size > self.config.max_bytes {
            return Err(ControllerError::Validation(format!(
                "file is {size} bytes, limit is {}",
                self.config.max_bytes
            )));
        }
        Ok(())
    }

    /// Upload an image for `node_id`, or hold it locally when the blob
    /// store cannot be reached.
    pub async fn upload(
        &self,
        node_id: &EntityId,
        board_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadOutcome> {
        self.validate(content_type, bytes.len())?;
        let mut entry = PendingUpload {
            id: EntityId::mint_client().to_string(),
            node_id: node_id.to_string(),
            board_id: board_id.to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len(),
            queued_at: timestamp(),
            attempts: 0,
            last_error: None,
        };

        if !self.connectivity.is_offline() {
            match self.send(&entry, &bytes).await {
                Ok(public_url) => return Ok(UploadOutcome::Uploaded { public_url }),
                Err(e) => {
                    tracing::warn!(
                        owner = %self.owner_id,
                        file = %file_name,
                        error = %e,
                        "upload failed; holding locally"
                    );
                    entry.attempts = 1;
                    entry.last_error = Some(e.to_string());
                }
            }
        }

        self.kv.set(&self.blob_key(&entry.id), &bytes)?;
        {
            let _index = self.index_lock.lock();
            let mut index = self.read_index()?;
            index.push(entry.clone());
            self.write_index(&index)?;
        }
        tracing::debug!(owner = %self.owner_id, id = %entry.id, "upload held");
        Ok(UploadOutcome::Queued { id: entry.id })
    }

    /// Held uploads in the order they will be replayed.
    pub fn pending_uploads(&self) -> Vec<PendingUpload> {
        self.read_index().unwrap_or_else(|e| {
            tracing::warn!(owner = %self.owner_id, error = %e, "unreadable upload index");
            Vec::new()
        })
    }

    /// Replay held uploads in order. `on_uploaded` sees each one that lands
    /// together with its public URL; failures stay held.
    pub async fn sync_pending(
        &self,
        on_uploaded: impl Fn(&PendingUpload, &str) + Send + Sync,
    ) -> UploadSyncReport {
        let mut report = UploadSyncReport::default();
        if self.connectivity.is_offline() {
            report.remaining = self.pending_uploads().len();
            return report;
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            report.remaining = self.pending_uploads().len();
            return report;
        }
        let _guard = SyncingGuard(&self.syncing);

        for entry in self.pending_uploads() {
            let bytes = match self.kv.get(&self.blob_key(&entry.id)) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    tracing::warn!(
                        owner = %self.owner_id,
                        id = %entry.id,
                        "held upload lost its bytes; dropping"
                    );
                    self.forget(&entry.id);
                    report.discarded += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        owner = %self.owner_id,
                        id = %entry.id,
                        error = %e,
                        "held upload unreadable"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            report.attempted += 1;
            match self.send(&entry, &bytes).await {
                Ok(public_url) => {
                    report.uploaded += 1;
                    self.forget(&entry.id);
                    on_uploaded(&entry, &public_url);
                }
                Err(e) => {
                    tracing::warn!(
                        owner = %self.owner_id,
                        id = %entry.id,
                        error = %e,
                        "held upload failed again"
                    );
                    report.failed += 1;
                    self.record_failure(&entry.id, &e);
                }
            }
        }

        report.remaining = self.pending_uploads().len();
        report
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn send(&self, entry: &PendingUpload, bytes: &[u8]) -> Result<String, RemoteError> {
        let target = self
            .blobs
            .presign(&PresignRequest {
                board_id: entry.board_id.clone(),
                file_name: entry.file_name.clone(),
                content_type: entry.content_type.clone(),
            })
            .await?;
        self.blobs.put(&target, &entry.content_type, bytes).await?;
        Ok(target.public_url)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.namespace)
    }

    fn blob_key(&self, id: &str) -> String {
        format!("{}:blob:{id}", self.namespace)
    }

    fn read_index(&self) -> Result<Vec<PendingUpload>, StorageError> {
        let key = self.index_key();
        match self.kv.get(&key)? {
            None => Ok(Vec::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| StorageError::Corruption { key, source }),
        }
    }

    fn write_index(&self, index: &[PendingUpload]) -> Result<(), StorageError> {
        let key = self.index_key();
        if index.is_empty() {
            return self.kv.remove(&key);
        }
        let bytes = serde_json::to_vec(index)
            .map_err(|source| StorageError::Encode { key: key.clone(), source })?;
        self.kv.set(&key, &bytes)
    }

    /// Remove a held upload: index entry first, then its bytes.
    fn forget(&self, id: &str) {
        let result = {
            let _index = self.index_lock.lock();
            self.read_index().and_then(|mut index| {
                index.retain(|e| e.id != id);
                self.write_index(&index)
            })
        };
        if let Err(e) = result.and_then(|()| self.kv.remove(&self.blob_key(id))) {
            tracing::warn!(owner = %self.owner_id, id, error = %e, "could not discard held upload");
        }
    }

    fn record_failure(&self, id: &str, error: &RemoteError) {
        let _index = self.index_lock.lock();
        let result = self.read_index().and_then(|mut index| {
            if let Some(entry) = index.iter_mut().find(|e| e.id == id) {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
            }
            self.write_index(&index)
        });
        if let Err(e) = result {
            tracing::warn!(
                owner = %self.owner_id,
                id,
                error = %e,
                "could not record upload failure"
            );
        }
    }
}

#[async_trait]
impl Drainable for Uploads {
    fn collection(&self) -> String {
        self.namespace.clone()
    }

    async fn drain(&self) -> DrainReport {
        let listener = self.listener.lock().clone();
        let report = self
            .sync_pending(move |entry, url| {
                if let Some(listener) = &listener {
                    listener(entry, url);
                }
            })
            .await;
        DrainReport {
            attempted: report.attempted,
            succeeded: report.uploaded,
            failed: report.failed,
            skipped: report.discarded,
            remaining: report.remaining,
            dead_lettered: 0,
            already_running: false,
        }
    }
}
