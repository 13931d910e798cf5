//! Services shared by every controller of one engine, and the per-collection
//! state shared by every live instance of the same collection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::queue::PendingQueue;
use crate::remote::RemoteBackend;
use crate::storage::{CacheStore, KvStore};
use crate::sync::bus::InvalidationBus;
use crate::sync::connectivity::Connectivity;
use crate::sync::executor::SyncExecutor;
use crate::sync::version::StateVersion;
use crate::types::{EntityId, PendingAction};

/// Handles to the engine-wide services a controller borrows.
#[derive(Clone)]
pub struct ControllerContext {
    pub config: Arc<SyncConfig>,
    pub kv: Arc<dyn KvStore>,
    pub cache: Arc<CacheStore>,
    pub remote: Arc<dyn RemoteBackend>,
    pub connectivity: Arc<Connectivity>,
    pub bus: InvalidationBus,
    collections: Arc<Mutex<HashMap<String, Arc<CollectionShared>>>>,
}

impl ControllerContext {
    pub fn new(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(Arc::clone(&kv), config.cache_key_prefix.clone()));
        Self {
            config: Arc::new(config),
            kv,
            cache,
            remote,
            connectivity,
            bus: InvalidationBus::new(),
            collections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shared state for `collection`, created on first use.
    pub(crate) fn shared(&self, collection: &str) -> Arc<CollectionShared> {
        let mut collections = self.collections.lock();
        let shared = collections.entry(collection.to_string()).or_insert_with(|| {
            let queue = Arc::new(PendingQueue::open(
                collection,
                Arc::clone(&self.kv),
                self.config.queue_key(collection),
                self.config.dead_letter_key(collection),
                self.config.local_id_prefix.clone(),
                self.config.retry.clone(),
            ));
            Arc::new(CollectionShared {
                sync: SyncExecutor::new(queue),
                version: StateVersion::new(),
                commit: Mutex::new(()),
                in_flight: Mutex::new(Vec::new()),
                confirmed: Mutex::new(HashMap::new()),
                next_ticket: Mutex::new(0),
            })
        });
        Arc::clone(shared)
    }

    /// The pending queue of `collection`.
    pub fn queue(&self, collection: &str) -> Arc<PendingQueue> {
        Arc::clone(self.shared(collection).sync.queue())
    }
}

/// State every instance of one collection shares.
///
/// Lock order: `commit` before the queue's internal lock, `in_flight` and
/// `confirmed`. The cache envelope is the collection's current optimistic
/// state; it is only rewritten while `commit` is held.
pub(crate) struct CollectionShared {
    pub sync: SyncExecutor,
    pub version: StateVersion,
    pub commit: Mutex<()>,
    /// Writes handed to an outbox worker and not yet resolved.
    pub in_flight: Mutex<Vec<(u64, PendingAction)>>,
    /// Local ids confirmed by the remote during this process.
    pub confirmed: Mutex<HashMap<EntityId, EntityId>>,
    next_ticket: Mutex<u64>,
}

impl CollectionShared {
    pub fn queue(&self) -> &Arc<PendingQueue> {
        self.sync.queue()
    }

    /// Record `action` as in flight. Returns its ticket.
    pub fn track(&self, action: &PendingAction) -> u64 {
        let ticket = {
            let mut next = self.next_ticket.lock();
            *next += 1;
            *next
        };
        self.in_flight.lock().push((ticket, action.clone()));
        ticket
    }

    pub fn untrack(&self, ticket: u64) {
        self.in_flight.lock().retain(|(t, _)| *t != ticket);
    }

    pub fn in_flight_actions(&self) -> Vec<PendingAction> {
        self.in_flight.lock().iter().map(|(_, a)| a.clone()).collect()
    }

    /// Apply every confirmation seen so far to `action`.
    pub fn rewrite_confirmed(&self, action: &mut PendingAction) {
        let confirmed = self.confirmed.lock();
        for (local, server) in confirmed.iter() {
            action.rewrite_id(local, server);
        }
    }
}
