//! Tests for image uploads and the offline holding area.

use std::sync::Arc;

use offsync::{
    EntityId, InMemoryBlobStore, InMemoryRemote, MemoryKv, OffsyncError, RemoteError, SyncConfig,
    SyncEngine, UploadOutcome,
};
use parking_lot::Mutex;

fn engine_with(blobs: &InMemoryBlobStore) -> SyncEngine {
    SyncEngine::in_memory(Arc::new(InMemoryRemote::new())).with_blob_store(Arc::new(blobs.clone()))
}

fn node() -> EntityId {
    EntityId::from("n1")
}

#[tokio::test]
async fn rejects_unsupported_empty_and_oversized_files() {
    let mut config = SyncConfig::default();
    config.uploads.max_bytes = 8;
    let blobs = InMemoryBlobStore::new();
    let engine = SyncEngine::new(
        config,
        Arc::new(MemoryKv::new()),
        Arc::new(InMemoryRemote::new()),
    )
    .unwrap()
    .with_blob_store(Arc::new(blobs.clone()));
    let uploads = engine.uploads("u1").unwrap();

    for (content_type, bytes) in [
        ("text/plain", vec![1u8]),
        ("image/png", vec![]),
        ("image/png", vec![0u8; 9]),
    ] {
        let err = uploads
            .upload(&node(), "b1", "f", content_type, bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, OffsyncError::Controller(_)), "{err}");
    }
    assert_eq!(blobs.object_count(), 0);
    assert!(uploads.pending_uploads().is_empty());
}

#[tokio::test]
async fn online_upload_lands_immediately() {
    let blobs = InMemoryBlobStore::new();
    let engine = engine_with(&blobs);
    let uploads = engine.uploads("u1").unwrap();

    let outcome = uploads
        .upload(&node(), "b1", "cat.png", "image/png", vec![1, 2, 3])
        .await
        .unwrap();

    let UploadOutcome::Uploaded { public_url } = outcome else {
        panic!("expected an upload, got {outcome:?}");
    };
    assert_eq!(
        blobs.object(&public_url),
        Some(("image/png".to_string(), vec![1, 2, 3]))
    );
    assert!(uploads.pending_uploads().is_empty());
}

#[tokio::test]
async fn offline_uploads_are_held_and_replayed_on_reconnect() {
    crate::init_tracing();
    let blobs = InMemoryBlobStore::new();
    let engine = engine_with(&blobs);
    let uploads = engine.uploads("u1").unwrap();
    let landed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&landed);
    uploads.set_listener(move |entry, url| {
        sink.lock().push((entry.node_id.clone(), url.to_string()));
    });

    engine.set_reachable(false).await;
    let first = uploads
        .upload(&node(), "b1", "a.png", "image/png", vec![1])
        .await
        .unwrap();
    uploads
        .upload(&node(), "b1", "b.jpg", "image/jpeg", vec![2])
        .await
        .unwrap();
    assert!(matches!(first, UploadOutcome::Queued { .. }));
    let held = uploads.pending_uploads();
    assert_eq!(held.len(), 2);
    assert_eq!(held[0].file_name, "a.png");
    assert_eq!(held[0].attempts, 0);
    assert_eq!(blobs.object_count(), 0);

    let reports = engine.set_reachable(true).await;

    let (collection, report) = &reports[0];
    assert_eq!(collection, "uploads:u1");
    assert_eq!(report.succeeded, 2);
    assert!(uploads.pending_uploads().is_empty());
    assert_eq!(blobs.object_count(), 2);

    let landed = landed.lock();
    assert_eq!(landed.len(), 2);
    assert_eq!(landed[0].0, "n1");
    assert!(landed[0].1.ends_with("a.png"));
    assert!(landed[1].1.ends_with("b.jpg"));
}

#[tokio::test]
async fn failed_uploads_stay_held_with_their_error() {
    crate::init_tracing();
    let blobs = InMemoryBlobStore::new();
    let engine = engine_with(&blobs);
    let uploads = engine.uploads("u1").unwrap();

    blobs.fail_next(RemoteError::new("presign refused"));
    let outcome = uploads
        .upload(&node(), "b1", "a.png", "image/png", vec![7])
        .await
        .unwrap();
    assert!(matches!(outcome, UploadOutcome::Queued { .. }));
    assert_eq!(uploads.pending_uploads()[0].attempts, 1);

    blobs.fail_next(RemoteError::new("still refused"));
    let report = uploads.sync_pending(|_, _| {}).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
    let held = &uploads.pending_uploads()[0];
    assert_eq!(held.attempts, 2);
    assert_eq!(held.last_error.as_deref(), Some("still refused"));

    let report = uploads.sync_pending(|_, _| {}).await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.remaining, 0);
}

#[tokio::test]
async fn uploads_need_a_blob_store() {
    let engine = SyncEngine::in_memory(Arc::new(InMemoryRemote::new()));
    assert!(matches!(engine.uploads("u1"), Err(OffsyncError::Config(_))));
}
