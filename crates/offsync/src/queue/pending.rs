//! PendingQueue: the ordered, durable log of unconfirmed writes.
//!
//! Mirrors the persisted `*_pending_queue` log: one JSON array of
//! `PendingAction`s per collection, rewritten whole after every change.
//!
//! Each entry carries an in-process sequence number and revision so a drain
//! pass can await the remote without holding the lock: entries are looked up
//! again by sequence number after every await, and an entry replaced by
//! dedupe while its old payload was in flight is kept for the next pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::config::RetryPolicy;
use crate::error::StorageError;
use crate::patch;
use crate::storage::KvStore;
use crate::types::{ActionKind, EntityId, PendingAction};

use super::{ActionExecutor, ExecOutcome};

// ============================================================================
// Types
// ============================================================================

/// An action the remote rejected permanently more often than the retry
/// policy allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub action: PendingAction,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Left queued without a remote call because they still reference an
    /// unconfirmed local id.
    pub skipped: usize,
    pub dead_lettered: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    revision: u64,
    action: PendingAction,
}

#[derive(Default)]
struct QueueState {
    slots: Vec<Slot>,
    dead: Vec<DeadLetter>,
    next_seq: u64,
    in_flight: Option<u64>,
}

impl QueueState {
    fn push(&mut self, action: PendingAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.push(Slot {
            seq,
            revision: 0,
            action,
        });
    }

    fn position(&self, seq: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.seq == seq)
    }

    fn actions(&self) -> Vec<PendingAction> {
        self.slots.iter().map(|s| s.action.clone()).collect()
    }
}

// ============================================================================
// PendingQueue
// ============================================================================

pub struct PendingQueue {
    collection: String,
    kv: Arc<dyn KvStore>,
    key: String,
    dead_key: String,
    local_prefix: String,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    count: watch::Sender<usize>,
}

impl PendingQueue {
    /// Open the queue persisted under `key`, restoring any actions left by a
    /// previous process. An undecodable log is logged and started empty.
    pub fn open(
        collection: impl Into<String>,
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        dead_key: impl Into<String>,
        local_prefix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let collection = collection.into();
        let key = key.into();
        let dead_key = dead_key.into();

        let mut state = QueueState::default();
        for action in read_log::<PendingAction>(kv.as_ref(), &collection, &key) {
            state.push(action);
        }
        state.dead = read_log(kv.as_ref(), &collection, &dead_key);

        let (count, _) = watch::channel(state.slots.len());
        Self {
            collection,
            kv,
            key,
            dead_key,
            local_prefix: local_prefix.into(),
            retry,
            state: Mutex::new(state),
            count,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Observe the pending count.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Queued actions in replay order.
    pub fn snapshot(&self) -> Vec<PendingAction> {
        self.state.lock().actions()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Append `action`, or replace the queued entry with the same dedupe key
    /// in place. Returns the new length.
    ///
    /// A replacement whose payload equals the entry's baseline cancels the
    /// entry outright, unless that entry is being replayed right now.
    pub fn enqueue(&self, action: PendingAction) -> usize {
        let mut state = self.state.lock();
        let existing = action.dedupe_key.as_ref().and_then(|key| {
            state
                .slots
                .iter()
                .position(|s| s.action.dedupe_key.as_ref() == Some(key))
        });

        match existing {
            Some(pos) => {
                let in_flight = state.in_flight == Some(state.slots[pos].seq);
                let slot = &mut state.slots[pos];
                let cancels = !in_flight
                    && slot.action.baseline.is_some()
                    && slot.action.baseline.as_ref() == Some(&action.payload);
                if cancels {
                    tracing::debug!(
                        collection = %self.collection,
                        key = ?slot.action.dedupe_key,
                        "queued write cancelled by its inverse"
                    );
                    state.slots.remove(pos);
                } else {
                    let baseline = slot.action.baseline.take().or(action.baseline.clone());
                    slot.action = PendingAction { baseline, ..action };
                    slot.revision += 1;
                }
            }
            None => state.push(action),
        }
        self.persist(&state);
        state.slots.len()
    }

    /// Fold an update of an unconfirmed entity into its queued create.
    /// Returns `false` if no create for `id` is queued or it is in flight.
    pub fn merge_into_create(&self, id: &EntityId, update: &Map<String, Value>) -> bool {
        let mut state = self.state.lock();
        let in_flight = state.in_flight;
        let Some(slot) = state.slots.iter_mut().find(|s| {
            s.action.kind == ActionKind::Create
                && &s.action.target_id == id
                && in_flight != Some(s.seq)
        }) else {
            return false;
        };
        let Some(fields) = slot.action.payload.as_object_mut() else {
            return false;
        };
        let mut update = update.clone();
        update.remove("id");
        patch::merge_fields(fields, &update);
        slot.revision += 1;
        self.persist(&state);
        true
    }

    /// Remove the queued create of a never-confirmed entity along with
    /// every other action targeting it, and strip it from queued orderings.
    ///
    /// Returns `false` (and changes nothing) when no create is queued or the
    /// create is being replayed right now.
    pub fn drop_unconfirmed(&self, id: &EntityId) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state
            .slots
            .iter()
            .position(|s| s.action.kind == ActionKind::Create && &s.action.target_id == id)
        else {
            return false;
        };
        if state.in_flight == Some(state.slots[pos].seq) {
            return false;
        }

        let in_flight = state.in_flight;
        state.slots.retain(|s| {
            in_flight == Some(s.seq) || s.action.kind.is_composite() || &s.action.target_id != id
        });
        for slot in state.slots.iter_mut() {
            if !slot.action.kind.is_composite() || in_flight == Some(slot.seq) {
                continue;
            }
            let mut updates = slot.action.composite_updates();
            let before = updates.len();
            updates.retain(|u| &u.id != id);
            if updates.len() != before {
                slot.action.set_composite_updates(&updates);
                slot.revision += 1;
            }
        }
        state.slots.retain(|s| {
            !s.action.kind.is_composite()
                || in_flight == Some(s.seq)
                || !s.action.composite_updates().is_empty()
        });
        for slot in state.slots.iter_mut() {
            if slot.action.kind.is_composite() && &slot.action.target_id == id {
                if let Some(first) = slot.action.composite_updates().into_iter().next() {
                    slot.action.target_id = first.id;
                }
            }
        }
        self.persist(&state);
        true
    }

    /// Replace `local` with `server` everywhere it appears in the queue.
    pub fn rewrite_id(&self, local: &EntityId, server: &EntityId) {
        let mut state = self.state.lock();
        let mut changed = false;
        for slot in state.slots.iter_mut() {
            if slot.action.rewrite_id(local, server) {
                changed = true;
            }
        }
        if changed {
            self.persist(&state);
        }
    }

    /// Whether any queued action references `id`.
    pub fn touches(&self, id: &EntityId) -> bool {
        self.state
            .lock()
            .slots
            .iter()
            .any(|s| s.action.references(id))
    }

    /// Whether a create of `id` is still queued.
    pub fn has_create(&self, id: &EntityId) -> bool {
        self.state
            .lock()
            .slots
            .iter()
            .any(|s| s.action.kind == ActionKind::Create && &s.action.target_id == id)
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Replay every queued action once, in order.
    ///
    /// Failed actions stay in place and the pass continues. Actions that
    /// still reference an unconfirmed local id are skipped without a remote
    /// call. Actions enqueued while the pass runs wait for the next pass.
    pub async fn drain<E: ActionExecutor + ?Sized>(&self, executor: &E) -> DrainOutcome {
        let seqs: Vec<u64> = self.state.lock().slots.iter().map(|s| s.seq).collect();
        let mut outcome = DrainOutcome::default();

        for seq in seqs {
            let (action, revision) = {
                let mut state = self.state.lock();
                let Some(pos) = state.position(seq) else {
                    continue;
                };
                let slot = &state.slots[pos];
                if self.blocked_by_local_id(&slot.action) {
                    outcome.skipped += 1;
                    continue;
                }
                let picked = (slot.action.clone(), slot.revision);
                state.in_flight = Some(seq);
                picked
            };

            outcome.attempted += 1;
            let result = executor.execute(&action).await;

            let mut state = self.state.lock();
            state.in_flight = None;
            match result {
                Ok(exec) => {
                    outcome.succeeded += 1;
                    if let Some(pos) = state.position(seq) {
                        if state.slots[pos].revision == revision {
                            state.slots.remove(pos);
                        } else if state.slots[pos].action.dedupe_key.is_some() {
                            // Replaced while in flight: the newer payload still
                            // has to go out, measured against what just landed.
                            state.slots[pos].action.baseline = Some(action.payload.clone());
                        }
                    }
                    if let ExecOutcome::Confirmed { server_id } = exec {
                        if server_id != action.target_id {
                            for slot in state.slots.iter_mut() {
                                slot.action.rewrite_id(&action.target_id, &server_id);
                            }
                            drop(state);
                            executor.on_id_confirmed(&action.target_id, &server_id);
                            state = self.state.lock();
                        }
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        collection = %self.collection,
                        kind = action.kind.as_str(),
                        target = %action.target_id,
                        error = %e,
                        "replay failed; action stays queued"
                    );
                    let Some(pos) = state.position(seq) else {
                        continue;
                    };
                    state.slots[pos].action.attempts += 1;
                    let attempts = state.slots[pos].action.attempts;
                    let exhausted = self
                        .retry
                        .max_attempts
                        .is_some_and(|max| e.is_permanent() && attempts >= max);
                    if exhausted {
                        let slot = state.slots.remove(pos);
                        tracing::warn!(
                            collection = %self.collection,
                            target = %slot.action.target_id,
                            attempts,
                            "action dead-lettered"
                        );
                        state.dead.push(DeadLetter {
                            action: slot.action,
                            error: e.message.clone(),
                            failed_at: Utc::now(),
                        });
                        outcome.dead_lettered += 1;
                        self.persist_dead(&state);
                    }
                }
            }
        }

        let state = self.state.lock();
        self.persist(&state);
        outcome.remaining = state.slots.len();
        outcome
    }

    fn blocked_by_local_id(&self, action: &PendingAction) -> bool {
        let ids = action.referenced_ids();
        ids.iter().any(|id| {
            id.is_local(&self.local_prefix)
                && !(action.kind == ActionKind::Create && id == &action.target_id)
        })
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }

    /// Move every dead-lettered action back to the end of the queue with a
    /// fresh attempt budget. Returns how many were requeued.
    pub fn retry_dead_letters(&self) -> usize {
        let mut state = self.state.lock();
        let dead = std::mem::take(&mut state.dead);
        let n = dead.len();
        for letter in dead {
            let mut action = letter.action;
            action.attempts = 0;
            state.push(action);
        }
        self.persist_dead(&state);
        self.persist(&state);
        n
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist(&self, state: &QueueState) {
        let len = state.slots.len();
        if let Err(e) = write_log(self.kv.as_ref(), &self.key, &state.actions()) {
            tracing::warn!(collection = %self.collection, error = %e, "queue persist failed");
        }
        self.count.send_replace(len);
    }

    fn persist_dead(&self, state: &QueueState) {
        if let Err(e) = write_log(self.kv.as_ref(), &self.dead_key, &state.dead) {
            tracing::warn!(collection = %self.collection, error = %e, "dead-letter persist failed");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn read_log<T: serde::de::DeserializeOwned>(
    kv: &dyn KvStore,
    collection: &str,
    key: &str,
) -> Vec<T> {
    let bytes = match kv.get(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::warn!(collection = %collection, error = %e, "queue load failed");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(items) => items,
        Err(source) => {
            let e = StorageError::Corruption {
                key: key.to_string(),
                source,
            };
            tracing::warn!(collection = %collection, error = %e, "queue log discarded");
            Vec::new()
        }
    }
}

fn write_log<T: Serialize>(kv: &dyn KvStore, key: &str, items: &[T]) -> Result<(), StorageError> {
    if items.is_empty() {
        return kv.remove(key);
    }
    let bytes = serde_json::to_vec(items).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })?;
    kv.set(key, &bytes)
}
