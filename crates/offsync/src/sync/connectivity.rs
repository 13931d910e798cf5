//! Connectivity: tracks transport reachability and replays queues on
//! regain.
//!
//! Collections register as [`Drainable`]s. When reachability goes from
//! unreachable to reachable, every live registration is drained
//! sequentially in registration order, so parents registered first replay
//! before their children. A global guard keeps two regain drains from
//! overlapping. Going unreachable only flips the offline flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::executor::DrainReport;

/// Something that owns a pending queue and can replay it.
#[async_trait]
pub trait Drainable: Send + Sync {
    /// Collection key, for logging and reports.
    fn collection(&self) -> String;

    async fn drain(&self) -> DrainReport;

    /// Reachability changed.
    fn offline_changed(&self, _offline: bool) {}
}

pub struct Connectivity {
    offline: watch::Sender<bool>,
    draining: AtomicBool,
    drain_on_reconnect: bool,
    registered: Mutex<Vec<Weak<dyn Drainable>>>,
}

/// Clears the draining flag when the pass ends.
struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Connectivity {
    pub fn new(initially_reachable: bool) -> Self {
        let (offline, _) = watch::channel(!initially_reachable);
        Self {
            offline,
            draining: AtomicBool::new(false),
            drain_on_reconnect: true,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Whether regaining reachability drains registered collections.
    pub fn with_drain_on_reconnect(mut self, enabled: bool) -> Self {
        self.drain_on_reconnect = enabled;
        self
    }

    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    /// Observe the offline flag.
    pub fn watch_offline(&self) -> watch::Receiver<bool> {
        self.offline.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Add a collection to the regain drain. Registrations whose owner has
    /// been dropped are pruned lazily.
    pub fn register(&self, drainable: Weak<dyn Drainable>) {
        self.registered.lock().push(drainable);
    }

    /// Live registrations in registration order.
    fn live(&self) -> Vec<Arc<dyn Drainable>> {
        let mut registered = self.registered.lock();
        registered.retain(|w| w.strong_count() > 0);
        registered.iter().filter_map(Weak::upgrade).collect()
    }

    /// Apply a reachability signal. On an unreachable → reachable transition
    /// this drains every registered collection and returns the reports.
    pub async fn set_reachable(&self, reachable: bool) -> Vec<(String, DrainReport)> {
        let was_offline = self.offline.send_replace(!reachable);
        if was_offline == !reachable {
            return Vec::new();
        }
        tracing::info!(reachable, "reachability changed");
        for drainable in self.live() {
            drainable.offline_changed(!reachable);
        }
        if reachable && was_offline && self.drain_on_reconnect {
            return self.drain_all().await;
        }
        Vec::new()
    }

    /// Drain every registered collection in order. Returns nothing when a
    /// drain started by someone else is still running or while offline.
    pub async fn drain_all(&self) -> Vec<(String, DrainReport)> {
        if self.is_offline() {
            return Vec::new();
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain already in progress");
            return Vec::new();
        }
        let _guard = DrainingGuard(&self.draining);

        let mut reports = Vec::new();
        for drainable in self.live() {
            let report = drainable.drain().await;
            reports.push((drainable.collection(), report));
        }
        reports
    }

    /// Follow a reachability stream until its sender is dropped.
    pub fn spawn_watch(self: Arc<Self>, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial = *signal.borrow_and_update();
            self.set_reachable(initial).await;
            while signal.changed().await.is_ok() {
                let reachable = *signal.borrow_and_update();
                self.set_reachable(reachable).await;
            }
        })
    }
}
