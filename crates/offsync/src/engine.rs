//! SyncEngine: wires storage, the remote and connectivity together and
//! opens controllers over them.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::controller::{CollectionController, CollectionDef, ControllerContext};
use crate::error::{ConfigError, Result};
use crate::families::{Boards, Nodes, Pages, Routines, Uploads};
use crate::remote::{BlobStore, RemoteBackend};
use crate::storage::{CacheStore, KvStore, MemoryKv};
use crate::sync::bus::InvalidationBus;
use crate::sync::connectivity::{Connectivity, Drainable};
use crate::sync::executor::DrainReport;
use crate::types::CollectionScope;

pub struct SyncEngine {
    ctx: ControllerContext,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl SyncEngine {
    /// An engine that starts out reachable.
    pub fn new(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteBackend>,
    ) -> Result<Self> {
        Self::with_reachability(config, kv, remote, true)
    }

    pub fn with_reachability(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteBackend>,
        initially_reachable: bool,
    ) -> Result<Self> {
        config.validate()?;
        let connectivity = Arc::new(
            Connectivity::new(initially_reachable)
                .with_drain_on_reconnect(config.drain_on_reconnect),
        );
        Ok(Self {
            ctx: ControllerContext::new(config, kv, remote, connectivity),
            blobs: None,
        })
    }

    /// Default configuration over a process-local store.
    pub fn in_memory(remote: Arc<dyn RemoteBackend>) -> Self {
        let config = SyncConfig::default();
        let connectivity = Arc::new(Connectivity::new(true));
        Self {
            ctx: ControllerContext::new(config, Arc::new(MemoryKv::new()), remote, connectivity),
            blobs: None,
        }
    }

    /// Persist to a SQLite file at `path`.
    #[cfg(feature = "sqlite")]
    pub fn open_sqlite(
        path: impl AsRef<std::path::Path>,
        config: SyncConfig,
        remote: Arc<dyn RemoteBackend>,
    ) -> Result<Self> {
        let kv = crate::storage::SqliteKv::open(path)?;
        Self::new(config, Arc::new(kv), remote)
    }

    /// Object storage used by [`Self::uploads`].
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.ctx.connectivity
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.ctx.bus
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.ctx.cache
    }

    /// Open a live controller instance. Several instances of the same scope
    /// share one queue and stay current through the bus.
    pub fn open(&self, def: CollectionDef, scope: CollectionScope) -> Arc<CollectionController> {
        CollectionController::new(def, scope, self.ctx.clone())
    }

    /// Feed a reachability signal. Regaining reachability drains every
    /// open collection in the order it was opened.
    pub async fn set_reachable(&self, reachable: bool) -> Vec<(String, DrainReport)> {
        self.ctx.connectivity.set_reachable(reachable).await
    }

    pub async fn drain_all(&self) -> Vec<(String, DrainReport)> {
        self.ctx.connectivity.drain_all().await
    }

    /// Follow a host reachability stream in the background.
    pub fn follow_reachability(&self, signal: watch::Receiver<bool>) -> JoinHandle<()> {
        Arc::clone(&self.ctx.connectivity).spawn_watch(signal)
    }

    /// Warm the cache mirror for scopes the user is likely to open next.
    /// Returns how many had cached state.
    pub fn preload(&self, scopes: &[CollectionScope]) -> usize {
        self.ctx.cache.preload(scopes.iter().map(CollectionScope::key))
    }

    // -----------------------------------------------------------------------
    // Families
    // -----------------------------------------------------------------------

    pub fn boards(&self, owner_id: &str) -> Boards {
        Boards::new(self.open(Boards::def(), Boards::scope(owner_id)))
    }

    pub fn nodes(&self, owner_id: &str, board_id: &str) -> Nodes {
        Nodes::new(self.open(Nodes::def(), Nodes::scope(owner_id, board_id)))
    }

    /// Opens the routines controller before the placements controller so
    /// drains replay routines first.
    pub fn routines(&self, owner_id: &str, board_id: &str) -> Routines {
        let routines = self.open(Routines::def(), Routines::scope(owner_id, board_id));
        let links = self.open(Routines::link_def(), Routines::link_scope(owner_id));
        Routines::new(routines, links)
    }

    pub fn pages(&self, owner_id: &str) -> Pages {
        Pages::new(self.open(Pages::def(), Pages::scope(owner_id)))
    }

    /// Upload handling for `owner_id`. Held uploads join regain drains for
    /// as long as the returned handle is alive.
    pub fn uploads(&self, owner_id: &str) -> Result<Arc<Uploads>> {
        let blobs = self
            .blobs
            .clone()
            .ok_or_else(|| ConfigError::Invalid("no blob store configured".to_string()))?;
        let config = &self.ctx.config;
        let uploads = Arc::new(Uploads::new(
            owner_id,
            config.upload_key(owner_id),
            config.uploads.clone(),
            Arc::clone(&self.ctx.kv),
            blobs,
            Arc::clone(&self.ctx.connectivity),
        ));
        let drainable: Weak<dyn Drainable> = Arc::downgrade(&uploads) as Weak<dyn Drainable>;
        self.ctx.connectivity.register(drainable);
        Ok(uploads)
    }
}
