//! Pending mutation queue and the executor contract used to replay it.

mod pending;

pub use pending::{DeadLetter, DrainOutcome, PendingQueue};

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::types::{EntityId, PendingAction};

// ============================================================================
// ActionExecutor: replays one queued action
// ============================================================================

/// Result of replaying one action against the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The remote accepted the write.
    Applied,
    /// A create was accepted and the remote assigned `server_id`.
    Confirmed { server_id: EntityId },
}

/// Dispatches a queued action to the remote by its kind.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &PendingAction) -> Result<ExecOutcome, RemoteError>;

    /// Called right after a confirmed create rewrote `local` to `server` in
    /// the queue, before the next action is replayed.
    fn on_id_confirmed(&self, _local: &EntityId, _server: &EntityId) {}
}
