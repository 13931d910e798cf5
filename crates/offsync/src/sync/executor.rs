//! SyncExecutor: replays a collection's pending queue against the remote.
//!
//! At most one drain runs per collection at a time; a second call while one
//! is running returns immediately with `already_running` set. Failures never
//! abort the pass and never surface as errors: they are tallied in the
//! [`DrainReport`] and the action stays queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RemoteError, RemoteErrorKind};
use crate::queue::PendingQueue;
use crate::remote::RemoteBackend;
use crate::types::{ActionKind, CollectionScope, PendingAction};

pub use crate::queue::{ActionExecutor, ExecOutcome};

// ============================================================================
// DrainReport
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub dead_lettered: usize,
    /// Another drain of this collection was already running; nothing was
    /// attempted.
    pub already_running: bool,
}

impl DrainReport {
    /// Whether the remote accepted at least one action, which means local
    /// state should be reconciled with a reload.
    pub fn needs_reload(&self) -> bool {
        self.succeeded > 0
    }
}

// ============================================================================
// SyncExecutor
// ============================================================================

pub struct SyncExecutor {
    queue: Arc<PendingQueue>,
    running: AtomicBool,
}

/// Resets the running flag when the drain finishes or its future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncExecutor {
    pub fn new(queue: Arc<PendingQueue>) -> Self {
        Self {
            queue,
            running: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Replay every queued action once, in order.
    pub async fn drain<E: ActionExecutor + ?Sized>(&self, executor: &E) -> DrainReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return DrainReport {
                remaining: self.queue.pending_count(),
                already_running: true,
                ..DrainReport::default()
            };
        }
        let _guard = RunningGuard(&self.running);

        if self.queue.is_empty() {
            return DrainReport::default();
        }

        let outcome = self.queue.drain(executor).await;
        tracing::debug!(
            collection = %self.queue.collection(),
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            remaining = outcome.remaining,
            "drain finished"
        );
        DrainReport {
            attempted: outcome.attempted,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            skipped: outcome.skipped,
            remaining: outcome.remaining,
            dead_lettered: outcome.dead_lettered,
            already_running: false,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Send one action to the remote, selecting the operation by its kind.
///
/// `server_assigned_ids` makes creates go out without an id so the remote
/// mints one. A delete of a row the remote no longer has counts as applied.
/// Composite actions use one atomic batch write when the backend supports
/// it and fall back to sequential writes otherwise; a partial fallback
/// failure leaves the whole action queued, which is safe to replay because
/// it carries absolute post-state.
pub async fn dispatch(
    remote: &dyn RemoteBackend,
    scope: &CollectionScope,
    action: &PendingAction,
    server_assigned_ids: bool,
) -> Result<ExecOutcome, RemoteError> {
    match action.kind {
        ActionKind::Create => {
            let mut fields = action
                .payload
                .as_object()
                .cloned()
                .ok_or_else(|| malformed(action))?;
            fields.remove("id");
            let id = (!server_assigned_ids).then_some(&action.target_id);
            let created = remote.create(scope, id, &fields).await?;
            Ok(ExecOutcome::Confirmed {
                server_id: created.id,
            })
        }
        ActionKind::Update => {
            let patch = action.update_patch().ok_or_else(|| malformed(action))?;
            remote.update(scope, &action.target_id, patch).await?;
            Ok(ExecOutcome::Applied)
        }
        ActionKind::Delete => match remote.delete(scope, &action.target_id).await {
            Ok(()) => Ok(ExecOutcome::Applied),
            Err(e) if e.kind == RemoteErrorKind::NotFound => Ok(ExecOutcome::Applied),
            Err(e) => Err(e),
        },
        ActionKind::Reorder | ActionKind::Move => {
            let updates = action.composite_updates();
            if updates.is_empty() {
                return Ok(ExecOutcome::Applied);
            }
            match remote.batch_update(scope, &updates).await {
                Ok(()) => Ok(ExecOutcome::Applied),
                Err(e) if e.kind == RemoteErrorKind::Unsupported => {
                    for update in &updates {
                        remote.update(scope, &update.id, &update.patch).await?;
                    }
                    Ok(ExecOutcome::Applied)
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn malformed(action: &PendingAction) -> RemoteError {
    RemoteError::with_kind(
        format!(
            "malformed {} payload for {}",
            action.kind.as_str(),
            action.target_id
        ),
        RemoteErrorKind::Permanent,
    )
}
