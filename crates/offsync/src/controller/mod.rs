//! CollectionController: optimistic CRUD over one remote-backed collection.
//!
//! Every mutation takes the same path: build a [`PendingAction`], apply it
//! to the collection's shared optimistic state (the cache envelope), bump
//! the version, persist, then hand the action to this instance's outbox and
//! publish an invalidation. Mutations return the optimistic result at once;
//! network confirmation happens on the outbox worker.
//!
//! The outbox worker delivers writes one at a time in call order. A write
//! goes to the remote directly unless the connection is down or the queue
//! already holds an action for one of its entities, in which case it is
//! queued behind them. A failed direct write is queued too. Updates and
//! deletes of never-confirmed entities fold into their queued create.
//!
//! Lookups for mutations read the shared state, so an instance that has not
//! reloaded yet still validates against the latest writes.

mod context;
mod def;

pub use context::ControllerContext;
pub use def::{apply_action, CollectionDef};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{ControllerError, RemoteError, Result};
use crate::patch;
use crate::queue::DeadLetter;
use crate::sync::bus::Subscription;
use crate::sync::connectivity::Drainable;
use crate::sync::executor::{dispatch, ActionExecutor, DrainReport, ExecOutcome};
use crate::types::{
    rewrite_field_values, ActionKind, CacheEnvelope, CollectionScope, Entity, EntityId,
    EntityPatch, InstanceId, InvalidationEvent, PendingAction,
};

use context::CollectionShared;

/// Upper bound on back-to-back drain passes while each pass makes progress.
const MAX_CHAINED_PASSES: usize = 4;

// ============================================================================
// ControllerStatus
// ============================================================================

/// What a view needs to render sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub loading: bool,
    pub is_offline: bool,
    /// Unsynced changes for this collection.
    pub pending_count: usize,
}

enum Outbound {
    Write { ticket: u64, action: PendingAction },
    Barrier(oneshot::Sender<()>),
}

// ============================================================================
// CollectionController
// ============================================================================

pub struct CollectionController {
    def: Arc<CollectionDef>,
    scope: CollectionScope,
    collection: String,
    instance_id: InstanceId,
    ctx: ControllerContext,
    shared: Arc<CollectionShared>,
    entities: Mutex<Vec<Entity>>,
    loading: AtomicBool,
    status: watch::Sender<ControllerStatus>,
    outbox: Option<mpsc::UnboundedSender<Outbound>>,
    invalidations: Mutex<Option<mpsc::UnboundedReceiver<InvalidationEvent>>>,
    _subscription: Subscription,
}

impl CollectionController {
    /// Create a live instance. Local state is hydrated from the cache
    /// immediately; call [`Self::reload`] to reconcile with the remote.
    ///
    /// Outside a tokio runtime there is no outbox worker and every write is
    /// queued for the next drain.
    pub fn new(def: CollectionDef, scope: CollectionScope, ctx: ControllerContext) -> Arc<Self> {
        let collection = scope.key();
        let instance_id = InstanceId::random(&def.family);
        let shared = ctx.shared(&collection);

        let mut entities = ctx
            .cache
            .load(&collection)
            .map(|e| e.entities)
            .unwrap_or_default();
        def.sort(&mut entities);

        let (inv_tx, inv_rx) = mpsc::unbounded_channel();
        let me = instance_id.clone();
        let subscription = ctx.bus.subscribe(collection.clone(), move |event| {
            if event.source_instance_id != me {
                let _ = inv_tx.send(event.clone());
            }
        });

        let runtime = tokio::runtime::Handle::try_current().ok();
        let (outbox, outbox_rx) = match runtime {
            Some(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let (status, _) = watch::channel(ControllerStatus {
            loading: false,
            is_offline: ctx.connectivity.is_offline(),
            pending_count: shared.queue().pending_count(),
        });

        let controller = Arc::new(Self {
            def: Arc::new(def),
            scope,
            collection,
            instance_id,
            ctx,
            shared,
            entities: Mutex::new(entities),
            loading: AtomicBool::new(false),
            status,
            outbox,
            invalidations: Mutex::new(Some(inv_rx)),
            _subscription: subscription,
        });

        if let (Some(handle), Some(rx)) = (runtime, outbox_rx) {
            handle.spawn(Self::run_outbox(Arc::downgrade(&controller), rx));
        }
        let drainable: Weak<dyn Drainable> = Arc::downgrade(&controller) as Weak<dyn Drainable>;
        controller.ctx.connectivity.register(drainable);

        tracing::debug!(
            collection = %controller.collection,
            instance = %controller.instance_id,
            "controller opened"
        );
        controller
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn def(&self) -> &CollectionDef {
        &self.def
    }

    pub fn scope(&self) -> &CollectionScope {
        &self.scope
    }

    /// Namespace key shared by the cache, the queue and the bus.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// This instance's current view, in presentation order.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities.lock().clone()
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.entities.lock().iter().find(|e| &e.id == id).cloned()
    }

    /// Members of one group, in position order.
    pub fn group(&self, group: &Value) -> Vec<Entity> {
        self.entities
            .lock()
            .iter()
            .filter(|e| self.def.group_of(e) == group)
            .cloned()
            .collect()
    }

    /// The collection's latest optimistic state, including writes made by
    /// other instances that this one has not reloaded yet.
    pub fn latest(&self) -> Vec<Entity> {
        self.current_state()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            loading: self.loading.load(Ordering::Acquire),
            is_offline: self.ctx.connectivity.is_offline(),
            pending_count: self.shared.queue().pending_count(),
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<ControllerStatus> {
        self.refresh_status();
        self.status.subscribe()
    }

    /// Queued actions in replay order.
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.shared.queue().snapshot()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.queue().dead_letters()
    }

    /// Requeue dead-lettered actions. They replay on the next drain.
    pub fn retry_dead_letters(&self) -> usize {
        let n = self.shared.queue().retry_dead_letters();
        self.refresh_status();
        n
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Create an entity. For families with server-assigned ids the returned
    /// entity carries a local id until the remote confirms it.
    pub fn create(&self, fields: Map<String, Value>) -> Result<Entity> {
        let id = match fields.get("id") {
            None => None,
            Some(Value::String(id)) => Some(EntityId::new(id.clone())),
            Some(other) => {
                let reason = format!("id must be a string, got {other}");
                return Err(ControllerError::Validation(reason).into());
            }
        };
        let prefix = &self.ctx.config.local_id_prefix;
        let id = match id {
            _ if self.def.server_assigned_ids => EntityId::mint_local(prefix),
            Some(id) => id,
            None => EntityId::mint_client(),
        };

        let mut entity = Entity::new(id, fields);
        if let Some(order_field) = self.def.order_field.clone() {
            if entity.get(&order_field).is_none() {
                let group = self.def.group_of(&entity).clone();
                let next = self
                    .current_state()
                    .iter()
                    .filter(|e| self.def.group_of(e) == &group)
                    .filter_map(|e| self.def.position_of(e))
                    .max()
                    .map_or(0, |max| max + 1);
                entity.set(order_field, Value::from(next));
            }
        }

        self.submit(PendingAction::create(&entity));
        Ok(entity)
    }

    /// Apply a merge patch to one entity.
    pub fn update(&self, id: &EntityId, patch: Map<String, Value>) -> Result<Entity> {
        let current = self.lookup(id)?;
        if patch::is_noop(&current.fields, &patch) {
            return Ok(current);
        }
        self.submit(PendingAction::update(id.clone(), patch));
        self.lookup(id)
    }

    /// Apply a latest-value-wins merge patch.
    ///
    /// Queued writes with the same `dedupe_key` collapse into one. `baseline`
    /// is the value that would make this write a no-op remotely; when `None`
    /// it is taken from the current values of the patched fields. A queued
    /// write replaced by its own baseline is dropped.
    pub fn update_keyed(
        &self,
        id: &EntityId,
        patch: Map<String, Value>,
        dedupe_key: impl Into<String>,
        baseline: Option<Value>,
    ) -> Result<Entity> {
        let current = self.lookup(id)?;
        if patch::is_noop(&current.fields, &patch) {
            return Ok(current);
        }
        let baseline =
            baseline.unwrap_or_else(|| Value::Object(patch::snapshot(&current.fields, &patch)));
        let action =
            PendingAction::update(id.clone(), patch).with_dedupe(dedupe_key, Some(baseline));
        self.submit(action);
        self.lookup(id)
    }

    pub fn delete(&self, id: &EntityId) -> Result<()> {
        self.lookup(id)?;
        self.submit(PendingAction::delete(id.clone()));
        Ok(())
    }

    /// Move the member at `from` to `to` within one group, shifting the
    /// members in between. Returns the group in its new order.
    ///
    /// The whole post-state of the group travels as one action.
    pub fn reorder(&self, group: &Value, from: usize, to: usize) -> Result<Vec<Entity>> {
        let order_field = self.order_field()?;
        let mut members: Vec<EntityId> = self.members_of(group, None);
        let len = members.len();
        if from >= len {
            return Err(ControllerError::InvalidIndex { index: from, len }.into());
        }
        if to >= len {
            return Err(ControllerError::InvalidIndex { index: to, len }.into());
        }
        if from == to {
            return Ok(self.group(group));
        }

        let moved = members.remove(from);
        members.insert(to, moved.clone());
        let updates = numbered(&members, &order_field, None);

        self.submit(PendingAction::composite(ActionKind::Reorder, moved, &updates));
        Ok(self.group(group))
    }

    /// Move `id` into `group` at `position`, renumbering both the group it
    /// leaves and the group it joins. One action carries both orderings.
    pub fn move_into(&self, id: &EntityId, group: Value, position: usize) -> Result<Entity> {
        let order_field = self.order_field()?;
        let Some(group_field) = self.def.group_field.clone() else {
            return Err(ControllerError::InvalidMove(format!(
                "collection \"{}\" is not grouped",
                self.collection
            ))
            .into());
        };
        let current = self.lookup(id)?;
        let source_group = self.def.group_of(&current).clone();

        let mut target: Vec<EntityId> = self.members_of(&group, Some(id));
        if position > target.len() {
            return Err(ControllerError::InvalidIndex {
                index: position,
                len: target.len(),
            }
            .into());
        }
        target.insert(position, id.clone());

        let mut updates = Vec::new();
        if source_group != group {
            let remaining = self.members_of(&source_group, Some(id));
            updates.extend(numbered(&remaining, &order_field, None));
        }
        updates.extend(numbered(
            &target,
            &order_field,
            Some((id, &group_field, &group)),
        ));

        self.submit(PendingAction::composite(ActionKind::Move, id.clone(), &updates));
        self.lookup(id)
    }

    // -----------------------------------------------------------------------
    // Reload / drain / invalidation
    // -----------------------------------------------------------------------

    /// Refresh this instance: first from the shared cache, then from the
    /// remote unless offline. Remote state is rebased onto still-pending
    /// writes and committed only if no optimistic write happened while it
    /// was being fetched. Returns whether remote state was committed.
    pub async fn reload(&self) -> bool {
        if let Some(envelope) = self.ctx.cache.load(&self.collection) {
            let _commit = self.shared.commit.lock();
            let mut entities = envelope.entities;
            self.def.sort(&mut entities);
            *self.entities.lock() = entities;
        }
        if self.ctx.connectivity.is_offline() {
            self.refresh_status();
            return false;
        }

        self.loading.store(true, Ordering::Release);
        self.refresh_status();
        let ticket = self.shared.version.ticket();
        let fetched = self.ctx.remote.fetch_all(&self.scope).await;
        self.loading.store(false, Ordering::Release);

        let committed = match fetched {
            Err(e) => {
                tracing::warn!(collection = %self.collection, error = %e, "reload failed");
                false
            }
            Ok(mut entities) => {
                let _commit = self.shared.commit.lock();
                self.shared.version.commit_if_current(&ticket, || {
                    self.def.sort(&mut entities);
                    let rebase = self
                        .shared
                        .queue()
                        .snapshot()
                        .into_iter()
                        .chain(self.shared.in_flight_actions());
                    for action in rebase {
                        self.def.apply(&mut entities, &action);
                    }
                    self.commit_state(entities);
                })
            }
        };
        self.refresh_status();
        committed
    }

    /// Replay this collection's queue. Reloads and publishes when the remote
    /// accepted anything.
    pub async fn drain(&self) -> DrainReport {
        if self.ctx.connectivity.is_offline() {
            return DrainReport {
                remaining: self.shared.queue().pending_count(),
                ..DrainReport::default()
            };
        }

        let replay = Replay { controller: self };
        let mut total = DrainReport::default();
        for _ in 0..MAX_CHAINED_PASSES {
            let pass = self.shared.sync.drain(&replay).await;
            total.attempted += pass.attempted;
            total.succeeded += pass.succeeded;
            total.failed += pass.failed;
            total.skipped = pass.skipped;
            total.dead_lettered += pass.dead_lettered;
            total.remaining = pass.remaining;
            total.already_running |= pass.already_running;
            if pass.already_running || pass.succeeded == 0 || pass.remaining == 0 {
                break;
            }
        }

        if total.needs_reload() {
            self.reload().await;
            self.publish();
        }
        self.refresh_status();
        total
    }

    /// Handle every invalidation received since the last call with a single
    /// reload. Returns how many events were pending.
    pub async fn process_invalidations(&self) -> usize {
        let mut received = 0;
        {
            let mut rx = self.invalidations.lock();
            if let Some(rx) = rx.as_mut() {
                while rx.try_recv().is_ok() {
                    received += 1;
                }
            }
        }
        if received > 0 {
            self.reload().await;
        }
        received
    }

    /// Reload on every invalidation from another instance, in the
    /// background. Returns `None` if a listener is already running.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.invalidations.lock().take()?;
        let this = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                let Some(controller) = this.upgrade() else {
                    break;
                };
                controller.reload().await;
            }
        }))
    }

    /// Wait until every write issued so far has left the outbox, either
    /// confirmed or queued.
    pub async fn settle(&self) {
        let Some(outbox) = &self.outbox else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if outbox.send(Outbound::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    // -----------------------------------------------------------------------
    // Internals: optimistic path
    // -----------------------------------------------------------------------

    fn submit(&self, action: PendingAction) {
        {
            let _commit = self.shared.commit.lock();
            self.apply_locked(&action);

            let nothing_in_flight = self.shared.in_flight.lock().is_empty();
            if self.ctx.connectivity.is_offline() && nothing_in_flight {
                self.enqueue(action);
            } else if let Some(outbox) = &self.outbox {
                let ticket = self.shared.track(&action);
                if let Err(mpsc::error::SendError(Outbound::Write { ticket, action })) =
                    outbox.send(Outbound::Write { ticket, action })
                {
                    self.enqueue(action);
                    self.shared.untrack(ticket);
                }
            } else {
                self.enqueue(action);
            }
        }
        self.publish();
        self.refresh_status();
    }

    /// Bump, apply to the shared state, persist. Caller holds `commit`.
    fn apply_locked(&self, action: &PendingAction) {
        self.shared.version.bump();
        let mut state = self.current_state();
        self.def.apply(&mut state, action);
        self.commit_state(state);
    }

    /// Adopt `state` as this instance's view and the shared cache.
    /// Caller holds `commit`.
    fn commit_state(&self, state: Vec<Entity>) {
        *self.entities.lock() = state.clone();
        self.ctx
            .cache
            .save(&self.collection, CacheEnvelope::new(state));
    }

    /// The collection's shared optimistic state.
    fn current_state(&self) -> Vec<Entity> {
        match self.ctx.cache.load(&self.collection) {
            Some(envelope) => envelope.entities,
            None => self.entities.lock().clone(),
        }
    }

    fn lookup(&self, id: &EntityId) -> Result<Entity> {
        self.current_state()
            .into_iter()
            .find(|e| &e.id == id)
            .ok_or_else(|| {
                ControllerError::NotFound {
                    collection: self.collection.clone(),
                    id: id.to_string(),
                }
                .into()
            })
    }

    fn order_field(&self) -> Result<String> {
        self.def
            .order_field
            .clone()
            .ok_or_else(|| ControllerError::Unordered(self.collection.clone()).into())
    }

    /// Ids of `group`'s members in position order, minus `except`.
    fn members_of(&self, group: &Value, except: Option<&EntityId>) -> Vec<EntityId> {
        self.current_state()
            .into_iter()
            .filter(|e| self.def.group_of(e) == group && Some(&e.id) != except)
            .map(|e| e.id)
            .collect()
    }

    /// Queue `action`, folding writes to unconfirmed entities into their
    /// queued create.
    ///
    /// An entity is unconfirmed while its create is still queued, whether
    /// its id is local or client-minted.
    fn enqueue(&self, action: PendingAction) {
        let queue = self.shared.queue();
        if queue.has_create(&action.target_id) {
            match action.kind {
                ActionKind::Update => {
                    if let Some(update) = action.update_patch() {
                        if queue.merge_into_create(&action.target_id, update) {
                            return;
                        }
                    }
                }
                ActionKind::Delete => {
                    if queue.drop_unconfirmed(&action.target_id) {
                        return;
                    }
                }
                _ => {}
            }
        }
        queue.enqueue(action);
    }

    fn publish(&self) {
        self.ctx.bus.publish(&self.collection, &self.instance_id);
    }

    fn refresh_status(&self) {
        let next = self.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // -----------------------------------------------------------------------
    // Internals: outbox worker
    // -----------------------------------------------------------------------

    async fn run_outbox(this: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(message) = rx.recv().await {
            match message {
                Outbound::Barrier(done) => {
                    let _ = done.send(());
                }
                Outbound::Write { ticket, action } => {
                    let Some(controller) = this.upgrade() else {
                        break;
                    };
                    controller.deliver(ticket, action).await;
                }
            }
        }
    }

    async fn deliver(&self, ticket: u64, mut action: PendingAction) {
        self.shared.rewrite_confirmed(&mut action);

        if self.ctx.connectivity.is_offline() || self.must_queue(&action) {
            self.park(ticket, action);
            return;
        }

        let result = dispatch(
            self.ctx.remote.as_ref(),
            &self.scope,
            &action,
            self.def.server_assigned_ids,
        )
        .await;
        match result {
            Ok(ExecOutcome::Confirmed { server_id }) if server_id != action.target_id => {
                self.confirm_id(&action.target_id, &server_id, Some(ticket));
            }
            Ok(_) => {
                let _commit = self.shared.commit.lock();
                self.shared.untrack(ticket);
            }
            Err(e) => {
                tracing::warn!(
                    collection = %self.collection,
                    kind = action.kind.as_str(),
                    target = %action.target_id,
                    error = %e,
                    "direct write failed; queued for retry"
                );
                self.park(ticket, action);
            }
        }
    }

    /// Whether `action` has to wait behind the queue: an entity it writes
    /// already has queued actions, or is still unconfirmed.
    fn must_queue(&self, action: &PendingAction) -> bool {
        let queue = self.shared.queue();
        let prefix = &self.ctx.config.local_id_prefix;
        action.referenced_ids().iter().any(|id| {
            queue.touches(id)
                || (id.is_local(prefix)
                    && !(action.kind == ActionKind::Create && id == &action.target_id))
        })
    }

    fn park(&self, ticket: u64, action: PendingAction) {
        {
            let _commit = self.shared.commit.lock();
            self.enqueue(action);
            self.shared.untrack(ticket);
        }
        self.publish();
        self.refresh_status();
    }

    /// The remote replaced `local` with `server`: rewrite every reference in
    /// shared state, the queue and in-flight writes.
    fn confirm_id(&self, local: &EntityId, server: &EntityId, ticket: Option<u64>) {
        {
            let _commit = self.shared.commit.lock();
            self.shared.version.bump();
            if let Some(ticket) = ticket {
                self.shared.untrack(ticket);
            }
            self.shared
                .confirmed
                .lock()
                .insert(local.clone(), server.clone());
            for (_, action) in self.shared.in_flight.lock().iter_mut() {
                action.rewrite_id(local, server);
            }
            self.shared.queue().rewrite_id(local, server);

            let mut state = self.current_state();
            let already_present = state.iter().any(|e| &e.id == server);
            if already_present {
                state.retain(|e| &e.id != local);
            }
            for entity in state.iter_mut() {
                if &entity.id == local {
                    entity.id = server.clone();
                }
                rewrite_field_values(&mut entity.fields, local, server);
            }
            self.def.sort(&mut state);
            self.commit_state(state);
        }
        tracing::debug!(
            collection = %self.collection,
            local = %local,
            server = %server,
            "id confirmed"
        );
        self.publish();
        self.refresh_status();
    }
}

/// Number `members` 0..n in `order_field`; the member named by `joining`
/// also gets its group field set.
fn numbered(
    members: &[EntityId],
    order_field: &str,
    joining: Option<(&EntityId, &String, &Value)>,
) -> Vec<EntityPatch> {
    members
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let mut patch = Map::new();
            patch.insert(order_field.to_string(), Value::from(i));
            if let Some((joiner, group_field, group)) = joining {
                if joiner == id {
                    patch.insert(group_field.clone(), group.clone());
                }
            }
            EntityPatch {
                id: id.clone(),
                patch,
            }
        })
        .collect()
}

// ============================================================================
// Replay: ActionExecutor for drains
// ============================================================================

struct Replay<'a> {
    controller: &'a CollectionController,
}

#[async_trait]
impl ActionExecutor for Replay<'_> {
    async fn execute(
        &self,
        action: &PendingAction,
    ) -> std::result::Result<ExecOutcome, RemoteError> {
        let c = self.controller;
        dispatch(c.ctx.remote.as_ref(), &c.scope, action, c.def.server_assigned_ids).await
    }

    fn on_id_confirmed(&self, local: &EntityId, server: &EntityId) {
        self.controller.confirm_id(local, server, None);
    }
}

#[async_trait]
impl Drainable for CollectionController {
    fn collection(&self) -> String {
        self.collection.clone()
    }

    async fn drain(&self) -> DrainReport {
        CollectionController::drain(self).await
    }

    fn offline_changed(&self, _offline: bool) {
        self.refresh_status();
    }
}
