//! StateVersion: guards shared state against stale reads.
//!
//! Every optimistic write bumps the counter first. A read captures a
//! [`VersionTicket`] before it starts and only commits while the ticket is
//! still current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct StateVersion {
    counter: Arc<AtomicU64>,
}

/// The version observed when a read started.
#[derive(Debug, Clone)]
pub struct VersionTicket {
    at_start: u64,
    counter: Arc<AtomicU64>,
}

impl StateVersion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the version. Returns the new value.
    pub fn bump(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn ticket(&self) -> VersionTicket {
        VersionTicket {
            at_start: self.current(),
            counter: Arc::clone(&self.counter),
        }
    }

    /// Run `commit` only if no write happened since `ticket` was taken.
    ///
    /// The caller must hold whatever lock protects the committed state, so
    /// that no bump can slip in between the check and the commit.
    pub fn commit_if_current(&self, ticket: &VersionTicket, commit: impl FnOnce()) -> bool {
        if ticket.is_current() {
            commit();
            true
        } else {
            tracing::debug!(
                started_at = ticket.at_start,
                current = self.current(),
                "stale read discarded"
            );
            false
        }
    }
}

impl VersionTicket {
    pub fn version(&self) -> u64 {
        self.at_start
    }

    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::Acquire) == self.at_start
    }
}
