//! offsync: offline-first optimistic synchronization for remote-backed
//! collections.
//!
//! Reads are served from a durable local cache, writes are applied
//! optimistically and either confirmed directly or parked in a durable
//! pending-mutation queue that replays when connectivity returns. Live
//! controller instances of the same collection keep each other current
//! through an in-process invalidation bus.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod families;
pub mod patch;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::{RetryPolicy, SyncConfig, UploadConfig};
pub use controller::{CollectionController, CollectionDef, ControllerContext, ControllerStatus};
pub use engine::SyncEngine;
pub use error::{
    ConfigError, ControllerError, OffsyncError, RemoteError, RemoteErrorKind, Result, StorageError,
};
pub use families::{
    Board, Boards, Milestone, NewNode, Node, Nodes, Page, Pages, PendingUpload, Routine,
    RoutineLink, Routines, UploadOutcome, UploadSyncReport, Uploads,
};
pub use queue::PendingQueue;
pub use remote::{
    BlobStore, InMemoryBlobStore, InMemoryRemote, PresignRequest, PresignedUpload, RemoteBackend,
};
pub use storage::{CacheStore, KvStore, MemoryKv};
pub use sync::{
    bus::{InvalidationBus, Subscription},
    connectivity::Connectivity,
    executor::{DrainReport, SyncExecutor},
    version::StateVersion,
};
pub use types::{
    ActionKind, CacheEnvelope, CollectionScope, Entity, EntityId, EntityPatch, InstanceId,
    InvalidationEvent, PendingAction,
};
