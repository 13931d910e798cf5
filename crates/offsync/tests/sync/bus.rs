//! Tests for InvalidationBus delivery rules.

use std::sync::Arc;

use offsync::{InstanceId, InvalidationBus, InvalidationEvent};
use parking_lot::Mutex;

#[test]
fn events_reach_only_their_collection() {
    let bus = InvalidationBus::new();
    let seen: Arc<Mutex<Vec<InvalidationEvent>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _sub = bus.subscribe("nodes:b1", move |e| sink.lock().push(e.clone()));

    let source = InstanceId::random("nodes");
    assert_eq!(bus.publish("nodes:b2", &source), 0);
    assert_eq!(bus.publish("nodes:b1", &source), 1);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].collection, "nodes:b1");
    assert_eq!(seen[0].source_instance_id, source);
}

#[test]
fn dropping_the_subscription_unsubscribes() {
    let bus = InvalidationBus::new();
    let sub = bus.subscribe("pages", |_| {});
    let other = bus.subscribe("pages", |_| {});
    assert_eq!(bus.listener_count("pages"), 2);

    drop(sub);
    assert_eq!(bus.listener_count("pages"), 1);
    other.unsubscribe();
    assert_eq!(bus.listener_count("pages"), 0);
}

#[test]
fn clones_share_listeners() {
    let bus = InvalidationBus::new();
    let twin = bus.clone();
    let _sub = twin.subscribe("boards", |_| {});
    assert_eq!(bus.publish("boards", &InstanceId::random("boards")), 1);
}
