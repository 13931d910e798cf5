//! Tests for CollectionController's optimistic mutations.

use std::sync::Arc;

use offsync::{
    CollectionDef, CollectionScope, ControllerError, Entity, InMemoryRemote, OffsyncError,
    SyncEngine,
};
use serde_json::{json, Map, Value};

// ============================================================================
// Helpers
// ============================================================================

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn entity(v: Value) -> Entity {
    serde_json::from_value(v).unwrap()
}

fn notes() -> (CollectionDef, CollectionScope) {
    (CollectionDef::new("notes"), CollectionScope::new("notes", "u1"))
}

fn ordered() -> (CollectionDef, CollectionScope) {
    (
        CollectionDef::new("cards").ordered_by("pos"),
        CollectionScope::new("cards", "u1"),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn create_is_visible_before_the_remote_confirms() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let (def, scope) = notes();
    let c = engine.open(def, scope.clone());

    let created = c.create(obj(json!({ "title": "hello" }))).unwrap();
    assert_eq!(c.entities().len(), 1);
    assert_eq!(c.get(&created.id).unwrap().get_str("title"), Some("hello"));

    c.settle().await;
    assert_eq!(remote.get(&scope, &created.id).unwrap().get_str("title"), Some("hello"));
    assert_eq!(c.status().pending_count, 0);
}

#[tokio::test]
async fn caller_supplied_id_is_kept() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let (def, scope) = notes();
    let c = engine.open(def, scope);

    let created = c.create(obj(json!({ "id": "fixed", "title": "x" }))).unwrap();
    assert_eq!(created.id, "fixed");

    let err = c.create(obj(json!({ "id": 5 }))).unwrap_err();
    assert!(matches!(err, OffsyncError::Controller(ControllerError::Validation(_))));
}

#[tokio::test]
async fn writes_to_unknown_ids_fail_without_side_effects() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let (def, scope) = notes();
    let c = engine.open(def, scope);

    let err = c.update(&"nope".into(), obj(json!({ "x": 1 }))).unwrap_err();
    assert!(matches!(err, OffsyncError::Controller(ControllerError::NotFound { .. })));
    assert!(c.delete(&"nope".into()).is_err());
    c.settle().await;
    assert_eq!(remote.write_count(), 0);
}

#[tokio::test]
async fn noop_update_sends_nothing() {
    let remote = InMemoryRemote::new();
    let (def, scope) = notes();
    remote.seed(&scope, vec![entity(json!({ "id": "n1", "title": "same" }))]);
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let c = engine.open(def, scope);
    assert!(c.reload().await);

    c.update(&"n1".into(), obj(json!({ "title": "same" }))).unwrap();
    c.settle().await;
    assert_eq!(remote.write_count(), 0);
}

#[tokio::test]
async fn create_appends_to_the_end_of_its_group() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote));
    let c = engine.open(
        CollectionDef::new("links").ordered_by("pos").grouped_by("node_id"),
        CollectionScope::new("links", "u1"),
    );

    let a = c.create(obj(json!({ "node_id": "n1" }))).unwrap();
    let b = c.create(obj(json!({ "node_id": "n1" }))).unwrap();
    let other = c.create(obj(json!({ "node_id": "n2" }))).unwrap();

    assert_eq!(a.get_i64("pos"), Some(0));
    assert_eq!(b.get_i64("pos"), Some(1));
    assert_eq!(other.get_i64("pos"), Some(0));
    assert_eq!(c.group(&json!("n1")).len(), 2);
}

#[tokio::test]
async fn reorder_rejects_out_of_range_indices() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote));
    let (def, scope) = ordered();
    let c = engine.open(def, scope);
    c.create(obj(json!({ "title": "only" }))).unwrap();

    let err = c.reorder(&Value::Null, 0, 1).unwrap_err();
    assert!(matches!(
        err,
        OffsyncError::Controller(ControllerError::InvalidIndex { index: 1, len: 1 })
    ));

    let (unordered, scope) = notes();
    let plain = engine.open(unordered, scope);
    assert!(matches!(
        plain.reorder(&Value::Null, 0, 0).unwrap_err(),
        OffsyncError::Controller(ControllerError::Unordered(_))
    ));
}

#[tokio::test]
async fn move_renumbers_both_groups_in_one_action() {
    let remote = InMemoryRemote::new();
    let scope = CollectionScope::new("links", "u1");
    remote.seed(
        &scope,
        vec![
            entity(json!({ "id": "a", "node_id": "n1", "pos": 0 })),
            entity(json!({ "id": "b", "node_id": "n1", "pos": 1 })),
            entity(json!({ "id": "c", "node_id": "n2", "pos": 0 })),
        ],
    );
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let c = engine.open(
        CollectionDef::new("links").ordered_by("pos").grouped_by("node_id"),
        scope.clone(),
    );
    c.reload().await;
    remote.reset_counts();

    let moved = c.move_into(&"a".into(), json!("n2"), 0).unwrap();
    assert_eq!(moved.get_str("node_id"), Some("n2"));

    let n1: Vec<String> = c.group(&json!("n1")).iter().map(|e| e.id.to_string()).collect();
    let n2: Vec<String> = c.group(&json!("n2")).iter().map(|e| e.id.to_string()).collect();
    assert_eq!(n1, ["b"]);
    assert_eq!(n2, ["a", "c"]);

    c.settle().await;
    assert_eq!(remote.call_count("batch_update"), 1);
    assert_eq!(remote.get(&scope, &"b".into()).unwrap().get_i64("pos"), Some(0));
    assert_eq!(remote.get(&scope, &"c".into()).unwrap().get_i64("pos"), Some(1));
    assert_eq!(remote.get(&scope, &"a".into()).unwrap().get_str("node_id"), Some("n2"));
}

#[tokio::test]
async fn move_past_the_end_is_rejected() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote));
    let c = engine.open(
        CollectionDef::new("links").ordered_by("pos").grouped_by("node_id"),
        CollectionScope::new("links", "u1"),
    );
    let a = c.create(obj(json!({ "node_id": "n1" }))).unwrap();
    let err = c.move_into(&a.id, json!("n2"), 1).unwrap_err();
    assert!(matches!(
        err,
        OffsyncError::Controller(ControllerError::InvalidIndex { index: 1, len: 0 })
    ));
}
