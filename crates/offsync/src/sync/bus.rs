//! InvalidationBus: in-process pub/sub between live controller instances.
//!
//! Listeners are grouped per collection and stored as `Arc<dyn Fn>` so a
//! publish can snapshot them cheaply:
//!   - A listener removed *during* a publish is still called in that round.
//!   - A listener added *during* a publish is not called until the next one.
//!
//! The lock is never held while handlers run, so a handler may subscribe,
//! unsubscribe or publish again. Filtering self-originated events is the
//! subscriber's job; the bus delivers to everyone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::{InstanceId, InvalidationEvent};

pub type ListenerId = u64;

/// Closure type for invalidation handlers.
pub type HandlerFn = dyn Fn(&InvalidationEvent) + Send + Sync;

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Arc<HandlerFn>)>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, collection: &str, id: ListenerId) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(collection) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                listeners.remove(collection);
            }
        }
    }
}

/// Cheaply cloneable handle; clones share one set of listeners.
#[derive(Clone, Default)]
pub struct InvalidationBus {
    inner: Arc<BusInner>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events on `collection`.
    pub fn subscribe(
        &self,
        collection: impl Into<String>,
        handler: impl Fn(&InvalidationEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let collection = collection.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .listeners
            .lock()
            .entry(collection.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            collection,
            id,
            active: true,
        }
    }

    /// Deliver an invalidation to every listener of `collection`. Returns
    /// how many handlers ran.
    pub fn publish(&self, collection: &str, source: &InstanceId) -> usize {
        let snapshot: Vec<Arc<HandlerFn>> = {
            let listeners = self.inner.listeners.lock();
            match listeners.get(collection) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };
        let event = InvalidationEvent {
            collection: collection.to_string(),
            source_instance_id: source.clone(),
        };
        tracing::trace!(
            collection = %collection,
            source = %source,
            listeners = snapshot.len(),
            "invalidation published"
        );
        for handler in &snapshot {
            handler(&event);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, collection: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(collection)
            .map_or(0, Vec::len)
    }
}

/// Keeps a handler registered. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<BusInner>,
    collection: String,
    id: ListenerId,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.collection, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
