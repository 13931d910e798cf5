//! Tests for SyncExecutor and action dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use offsync::queue::{ActionExecutor, ExecOutcome};
use offsync::storage::MemoryKv;
use offsync::sync::executor::dispatch;
use offsync::{
    ActionKind, CollectionScope, Entity, EntityPatch, InMemoryRemote, PendingAction, PendingQueue,
    RemoteError, RemoteErrorKind, RetryPolicy, SyncExecutor,
};
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn entity(v: Value) -> Entity {
    serde_json::from_value(v).unwrap()
}

/// Blocks every execution until released.
struct Gate(Notify);

#[async_trait]
impl ActionExecutor for Gate {
    async fn execute(&self, _action: &PendingAction) -> Result<ExecOutcome, RemoteError> {
        self.0.notified().await;
        Ok(ExecOutcome::Applied)
    }
}

// ============================================================================
// SyncExecutor
// ============================================================================

#[tokio::test]
async fn overlapping_drain_reports_already_running() {
    crate::init_tracing();
    let queue = Arc::new(PendingQueue::open(
        "pages",
        Arc::new(MemoryKv::new()),
        "pending:pages",
        "pending:dead:pages",
        "temp_",
        RetryPolicy::default(),
    ));
    queue.enqueue(PendingAction::delete("p1".into()));
    let executor = SyncExecutor::new(Arc::clone(&queue));
    let gate = Gate(Notify::new());

    let (first, second) = tokio::join!(executor.drain(&gate), async {
        tokio::task::yield_now().await;
        let report = executor.drain(&gate).await;
        gate.0.notify_one();
        report
    });

    assert!(!first.already_running);
    assert_eq!(first.succeeded, 1);
    assert!(second.already_running);
    assert_eq!(second.attempted, 0);
    assert_eq!(second.remaining, 1);
    assert!(!executor.is_running());
    assert!(queue.is_empty());
}

#[tokio::test]
async fn empty_queue_drains_to_a_default_report() {
    let queue = Arc::new(PendingQueue::open(
        "pages",
        Arc::new(MemoryKv::new()),
        "pending:pages",
        "pending:dead:pages",
        "temp_",
        RetryPolicy::default(),
    ));
    let executor = SyncExecutor::new(queue);
    let report = executor.drain(&Gate(Notify::new())).await;
    assert_eq!(report, Default::default());
    assert!(!report.needs_reload());
}

// ============================================================================
// dispatch
// ============================================================================

#[tokio::test]
async fn create_without_client_id_is_confirmed_under_server_id() {
    let remote = InMemoryRemote::new().with_server_ids("boards");
    let scope = CollectionScope::new("boards", "u1");
    let action = PendingAction::create(&Entity::new("temp_1", obj(json!({ "title": "A" }))));

    let outcome = dispatch(&remote, &scope, &action, true).await.unwrap();

    assert_eq!(
        outcome,
        ExecOutcome::Confirmed {
            server_id: "srv-1".into()
        }
    );
    let stored = remote.entities(&scope);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("title"), Some("A"));
    assert!(stored[0].get("id").is_none());
}

#[tokio::test]
async fn delete_of_missing_row_counts_as_applied() {
    let remote = InMemoryRemote::new();
    let scope = CollectionScope::new("pages", "u1");
    let outcome = dispatch(&remote, &scope, &PendingAction::delete("gone".into()), false)
        .await
        .unwrap();
    assert_eq!(outcome, ExecOutcome::Applied);
}

#[tokio::test]
async fn composite_falls_back_to_sequential_updates() {
    let remote = InMemoryRemote::new().with_batch_support(false);
    let scope = CollectionScope::new("routine_nodes", "u1");
    remote.seed(
        &scope,
        vec![
            entity(json!({ "id": "l1", "sort_order": 0 })),
            entity(json!({ "id": "l2", "sort_order": 1 })),
        ],
    );
    let action = PendingAction::composite(
        ActionKind::Reorder,
        "l1".into(),
        &[
            EntityPatch {
                id: "l2".into(),
                patch: obj(json!({ "sort_order": 0 })),
            },
            EntityPatch {
                id: "l1".into(),
                patch: obj(json!({ "sort_order": 1 })),
            },
        ],
    );

    dispatch(&remote, &scope, &action, false).await.unwrap();

    assert_eq!(remote.call_count("batch_update"), 1);
    assert_eq!(remote.call_count("update"), 2);
    assert_eq!(remote.get(&scope, &"l1".into()).unwrap().get_i64("sort_order"), Some(1));
}

#[tokio::test]
async fn offline_remote_surfaces_offline_errors() {
    let remote = InMemoryRemote::new();
    remote.set_offline(true);
    let scope = CollectionScope::new("pages", "u1");
    let err = dispatch(
        &remote,
        &scope,
        &PendingAction::update("p1".into(), obj(json!({ "x": 1 }))),
        false,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Offline);
}
