//! Tests for the nodes family: placement defaults and stacking.

use std::sync::Arc;

use offsync::{EntityId, InMemoryRemote, NewNode, Nodes, SyncEngine};

fn z_order(nodes: &Nodes) -> Vec<(EntityId, i64)> {
    nodes
        .sorted_by_z()
        .into_iter()
        .map(|n| (n.id, n.z_index))
        .collect()
}

#[tokio::test]
async fn new_nodes_get_defaults_and_stack_on_top() {
    let engine = SyncEngine::in_memory(Arc::new(InMemoryRemote::new().with_server_ids("nodes")));
    engine.set_reachable(false).await;
    let nodes = engine.nodes("u1", "b1");

    let a = nodes.add_node(NewNode::default()).unwrap();
    let b = nodes.add_node(NewNode::at(40.0, 60.0)).unwrap();

    assert_eq!(a.kind, "image");
    assert_eq!((a.width, a.height), (200.0, 200.0));
    assert_eq!(a.board_id, "b1");
    assert_eq!(a.z_index, 0);
    assert_eq!(b.z_index, 1);
    assert_eq!((b.x, b.y), (40.0, 60.0));
}

#[tokio::test]
async fn front_and_back_jump_past_the_extremes() {
    let engine = SyncEngine::in_memory(Arc::new(InMemoryRemote::new().with_server_ids("nodes")));
    engine.set_reachable(false).await;
    let nodes = engine.nodes("u1", "b1");
    let a = nodes.add_node(NewNode::default()).unwrap();
    let b = nodes.add_node(NewNode::default()).unwrap();
    let c = nodes.add_node(NewNode::default()).unwrap();

    assert_eq!(nodes.bring_to_front(&a.id).unwrap().z_index, 3);
    assert_eq!(nodes.send_to_back(&c.id).unwrap().z_index, 0);

    let order: Vec<EntityId> = z_order(&nodes).into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, [c.id.clone(), b.id.clone(), a.id.clone()]);

    // Already on top: nothing to do.
    assert_eq!(nodes.bring_to_front(&a.id).unwrap().z_index, 3);
}

#[tokio::test]
async fn forward_and_backward_swap_neighbours() {
    let engine = SyncEngine::in_memory(Arc::new(InMemoryRemote::new().with_server_ids("nodes")));
    engine.set_reachable(false).await;
    let nodes = engine.nodes("u1", "b1");
    let a = nodes.add_node(NewNode::default()).unwrap();
    let b = nodes.add_node(NewNode::default()).unwrap();
    let c = nodes.add_node(NewNode::default()).unwrap();

    let stack = nodes.bring_forward(&a.id).unwrap();
    let ids: Vec<EntityId> = stack.iter().map(|n| n.id.clone()).collect();
    assert_eq!(ids, [b.id.clone(), a.id.clone(), c.id.clone()]);

    let stack = nodes.send_backward(&c.id).unwrap();
    let ids: Vec<EntityId> = stack.iter().map(|n| n.id.clone()).collect();
    assert_eq!(ids, [b.id.clone(), c.id.clone(), a.id.clone()]);
    assert_eq!(
        stack.iter().map(|n| n.z_index).collect::<Vec<_>>(),
        [0, 1, 2]
    );

    // Bottom node cannot go lower.
    assert_eq!(nodes.send_backward(&b.id).unwrap()[0].id, b.id);
}

#[tokio::test]
async fn image_url_follows_the_confirmed_node() {
    let remote = InMemoryRemote::new().with_server_ids("nodes");
    let engine = SyncEngine::in_memory(Arc::new(remote.clone()));
    let nodes = engine.nodes("u1", "b1");

    nodes.add_node(NewNode::default()).unwrap();
    nodes.controller().settle().await;
    let id = nodes.sorted_by_z()[0].id.clone();
    assert_eq!(id, "srv-1");

    nodes.set_image(&id, "https://cdn.example/a.png").unwrap();
    nodes.controller().settle().await;
    let stored = remote.get(&Nodes::scope("u1", "b1"), &id).unwrap();
    assert_eq!(stored.get_str("image_url"), Some("https://cdn.example/a.png"));
    assert_eq!(stored.get_str("board_id"), Some("b1"));
}
