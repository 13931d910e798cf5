//! End-to-end flows across instances, outages and id confirmation.

use std::collections::BTreeMap;
use std::sync::Arc;

use offsync::{
    ActionKind, CollectionDef, CollectionScope, Entity, InMemoryRemote, SyncEngine,
};
use serde_json::{json, Map, Value};

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn entity(v: Value) -> Entity {
    serde_json::from_value(v).unwrap()
}

fn boards() -> (CollectionDef, CollectionScope) {
    (
        CollectionDef::new("boards").server_assigned_ids(),
        CollectionScope::new("boards", "u1"),
    )
}

#[tokio::test]
async fn offline_create_then_delete_never_reaches_the_remote() {
    crate::init_tracing();
    let remote = InMemoryRemote::new().with_server_ids("boards");
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let (def, scope) = boards();
    let c = engine.open(def, scope.clone());

    engine.set_reachable(false).await;
    let created = c.create(obj(json!({ "title": "scratch" }))).unwrap();
    assert!(created.id.is_local("temp_"));
    assert_eq!(c.status().pending_count, 1);

    c.delete(&created.id).unwrap();
    assert_eq!(c.status().pending_count, 0);
    assert!(c.entities().is_empty());

    let reports = engine.set_reachable(true).await;
    assert_eq!(reports[0].1.attempted, 0);
    assert_eq!(remote.write_count(), 0);
    assert!(remote.entities(&scope).is_empty());
}

#[tokio::test]
async fn other_instances_catch_up_on_invalidation() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let scope = CollectionScope::new("pages", "u1");
    let editor = engine.open(CollectionDef::new("pages"), scope.clone());
    let viewer = engine.open(CollectionDef::new("pages"), scope.clone());

    let page = editor.create(obj(json!({ "node_id": "n1", "content": "draft" }))).unwrap();
    assert!(viewer.get(&page.id).is_none());

    assert_eq!(editor.process_invalidations().await, 0);
    assert_eq!(viewer.process_invalidations().await, 1);
    assert_eq!(viewer.get(&page.id).unwrap().get_str("content"), Some("draft"));

    editor.settle().await;
    assert_eq!(viewer.process_invalidations().await, 0);
    assert_eq!(remote.entities(&scope).len(), 1);
}

#[tokio::test]
async fn invalidation_listener_reloads_in_the_background() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let scope = CollectionScope::new("pages", "u1");
    let editor = engine.open(CollectionDef::new("pages"), scope.clone());
    let viewer = engine.open(CollectionDef::new("pages"), scope);
    let handle = viewer.spawn_invalidation_listener().unwrap();
    assert!(viewer.spawn_invalidation_listener().is_none());

    let page = editor.create(obj(json!({ "node_id": "n1" }))).unwrap();
    editor.settle().await;
    for _ in 0..10 {
        if viewer.get(&page.id).is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(viewer.get(&page.id).is_some());
    handle.abort();
}

#[tokio::test]
async fn reorder_moves_one_member_and_shifts_the_rest() {
    let remote = InMemoryRemote::new();
    let scope = CollectionScope::new("cards", "u1");
    remote.seed(
        &scope,
        (0..5)
            .map(|i| entity(json!({ "id": format!("e{i}"), "pos": i })))
            .collect(),
    );
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let c = engine.open(CollectionDef::new("cards").ordered_by("pos"), scope.clone());
    c.reload().await;

    let order: Vec<String> = c
        .reorder(&Value::Null, 0, 3)
        .unwrap()
        .iter()
        .map(|e| e.id.to_string())
        .collect();
    assert_eq!(order, ["e1", "e2", "e3", "e0", "e4"]);

    c.settle().await;
    let remote_pos = |id: &str| remote.get(&scope, &id.into()).unwrap().get_i64("pos");
    assert_eq!(remote_pos("e0"), Some(3));
    assert_eq!(remote_pos("e1"), Some(0));
    assert_eq!(remote_pos("e4"), Some(4));
    assert_eq!(remote.call_count("batch_update"), 1);
}

#[tokio::test]
async fn offline_reorder_is_one_queued_action() {
    let remote = InMemoryRemote::new();
    let scope = CollectionScope::new("cards", "u1");
    remote.seed(
        &scope,
        (0..3)
            .map(|i| entity(json!({ "id": format!("e{i}"), "pos": i })))
            .collect(),
    );
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let c = engine.open(CollectionDef::new("cards").ordered_by("pos"), scope.clone());
    c.reload().await;

    engine.set_reachable(false).await;
    c.reorder(&Value::Null, 2, 0).unwrap();
    let pending = c.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ActionKind::Reorder);
    assert_eq!(pending[0].composite_updates().len(), 3);

    engine.set_reachable(true).await;
    assert_eq!(remote.get(&scope, &"e2".into()).unwrap().get_i64("pos"), Some(0));
    assert_eq!(c.status().pending_count, 0);
}

#[tokio::test]
async fn server_ids_replace_local_ids_everywhere() {
    crate::init_tracing();
    let remote = InMemoryRemote::new().with_server_ids("boards");
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let (def, scope) = boards();
    let c = engine.open(def, scope.clone());

    let created = c.create(obj(json!({ "title": "first" }))).unwrap();
    c.update(&created.id, obj(json!({ "title": "renamed" }))).unwrap();
    c.settle().await;

    assert!(c.get(&created.id).is_none());
    let confirmed = c.get(&"srv-1".into()).unwrap();
    assert_eq!(confirmed.get_str("title"), Some("renamed"));
    assert_eq!(
        remote.get(&scope, &"srv-1".into()).unwrap().get_str("title"),
        Some("renamed")
    );
    assert_eq!(c.status().pending_count, 0);
}

#[tokio::test]
async fn offline_create_and_edit_replay_as_one_create() {
    let remote = InMemoryRemote::new().with_server_ids("boards");
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let (def, scope) = boards();
    let c = engine.open(def, scope.clone());

    engine.set_reachable(false).await;
    let created = c.create(obj(json!({ "title": "draft" }))).unwrap();
    c.update(&created.id, obj(json!({ "title": "final" }))).unwrap();
    assert_eq!(c.status().pending_count, 1);

    engine.set_reachable(true).await;
    assert_eq!(remote.call_count("create"), 1);
    assert_eq!(remote.call_count("update"), 0);
    let stored = remote.entities(&scope);
    assert_eq!(stored[0].id, "srv-1");
    assert_eq!(stored[0].get_str("title"), Some("final"));
    assert_eq!(c.entities()[0].id, "srv-1");
}

#[tokio::test]
async fn offline_create_then_delete_with_client_ids_cancels_out() {
    let remote = InMemoryRemote::new();
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let scope = CollectionScope::new("pages", "u1");
    let c = engine.open(CollectionDef::new("pages"), scope.clone());

    engine.set_reachable(false).await;
    let page = c.create(obj(json!({ "node_id": "n1" }))).unwrap();
    assert!(!page.id.is_local("temp_"));
    c.update(&page.id, obj(json!({ "content": "draft" }))).unwrap();
    let pending = c.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ActionKind::Create);

    c.delete(&page.id).unwrap();
    assert_eq!(c.status().pending_count, 0);

    engine.set_reachable(true).await;
    assert_eq!(remote.write_count(), 0);
    assert!(remote.entities(&scope).is_empty());
}

#[tokio::test]
async fn offline_reorder_of_five_replays_as_one_action() {
    let remote = InMemoryRemote::new();
    let scope = CollectionScope::new("cards", "u1");
    remote.seed(
        &scope,
        (0..5)
            .map(|i| entity(json!({ "id": format!("e{i}"), "pos": i })))
            .collect(),
    );
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let c = engine.open(CollectionDef::new("cards").ordered_by("pos"), scope.clone());
    c.reload().await;

    engine.set_reachable(false).await;
    c.reorder(&Value::Null, 0, 3).unwrap();
    let pending = c.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ActionKind::Reorder);

    remote.reset_counts();
    engine.set_reachable(true).await;

    assert_eq!(remote.write_count(), 1);
    let mut stored = remote.entities(&scope);
    stored.sort_by_key(|e| e.get_i64("pos"));
    let order: Vec<&str> = stored.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(order, ["e1", "e2", "e3", "e0", "e4"]);
    let local: Vec<String> = c.entities().iter().map(|e| e.id.to_string()).collect();
    assert_eq!(local, ["e1", "e2", "e3", "e0", "e4"]);
}

fn by_id(
    entities: Vec<Entity>,
    rename: Option<(&str, &str)>,
) -> BTreeMap<String, Map<String, Value>> {
    entities
        .into_iter()
        .map(|e| {
            let id = match rename {
                Some((from, to)) if e.id == from => to.to_string(),
                _ => e.id.to_string(),
            };
            (id, e.fields)
        })
        .collect()
}

#[tokio::test]
async fn offline_history_converges_with_the_remote() {
    crate::init_tracing();
    let remote = InMemoryRemote::new().with_server_ids("cards");
    let scope = CollectionScope::new("cards", "u1");
    remote.seed(
        &scope,
        (0..4)
            .map(|i| {
                entity(json!({
                    "id": format!("e{i}"),
                    "lane": "a",
                    "pos": i,
                    "title": format!("card {i}"),
                }))
            })
            .collect(),
    );
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let def = CollectionDef::new("cards")
        .server_assigned_ids()
        .ordered_by("pos")
        .grouped_by("lane");
    let c = engine.open(def, scope.clone());
    c.reload().await;
    let lane_a = Value::from("a");

    engine.set_reachable(false).await;
    let x = c.create(obj(json!({ "lane": "a", "title": "new" }))).unwrap();
    c.update(&"e1".into(), obj(json!({ "title": "edited" }))).unwrap();
    c.delete(&"e2".into()).unwrap();
    c.reorder(&lane_a, 3, 0).unwrap();
    c.move_into(&"e3".into(), Value::from("b"), 0).unwrap();
    c.update(&x.id, obj(json!({ "title": "renamed" }))).unwrap();
    let optimistic = by_id(c.entities(), Some((x.id.as_str(), "srv-1")));

    engine.set_reachable(true).await;

    assert_eq!(c.status().pending_count, 0);
    assert_eq!(by_id(remote.entities(&scope), None), optimistic);
    assert_eq!(by_id(c.entities(), None), optimistic);
    assert_eq!(optimistic["srv-1"].get("title"), Some(&json!("renamed")));
    assert_eq!(optimistic["srv-1"].get("pos"), Some(&json!(0)));
    assert_eq!(optimistic["e3"].get("lane"), Some(&json!("b")));
    assert!(!optimistic.contains_key("e2"));
}
