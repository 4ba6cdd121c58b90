//! Integration tests for SqliteKvStore

use std::collections::BTreeMap;
use std::sync::Arc;

use dprofile_core::domain::{StorageError, SyncMode, SyncStatus};
use dprofile_core::ports::IKvStore;
use dprofile_store::SqliteKvStore;

// ============================================================================
// Test helpers
// ============================================================================

async fn setup(owner: &str) -> SqliteKvStore {
    let store = SqliteKvStore::in_memory("dp_kv_store", owner);
    store.init().await.expect("Failed to create in-memory KV store");
    store
}

fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ============================================================================
// Reads and writes
// ============================================================================

#[tokio::test]
async fn test_put_and_get() {
    let store = setup("uuid-a").await;
    store.put("dev#a#deviceName", "phone").await.unwrap();
    assert_eq!(
        store.get("dev#a#deviceName").await.unwrap().as_deref(),
        Some("phone")
    );
    assert_eq!(store.get("dev#a#osType").await.unwrap(), None);
}

#[tokio::test]
async fn test_get_by_prefix_treats_underscore_literally() {
    let store = setup("uuid-a").await;
    store
        .put_batch(&entries(&[
            ("svr#a#cam_OH#serviceType", "1"),
            ("svr#a#camXOH#serviceType", "2"),
            ("svr#b#cam#serviceType", "3"),
        ]))
        .await
        .unwrap();

    let found = store.get_by_prefix("svr#a#cam_").await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(found.contains_key("svr#a#cam_OH#serviceType"));

    assert_eq!(store.get_by_prefix("svr#").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_by_owner_matches_exactly() {
    let store = setup("uuid-a").await;
    store.put("dev#a#deviceName", "phone").await.unwrap();
    store
        .put_with_owner(&entries(&[("dev#a#osType", "10")]), "cloud")
        .await
        .unwrap();

    let owned = store.get_by_owner("uuid-a").await.unwrap();
    assert_eq!(owned.len(), 1);
    assert!(owned.contains_key("dev#a#deviceName"));
    assert!(store.get_by_owner("uuid").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_batch_ignores_missing_keys() {
    let store = setup("uuid-a").await;
    store
        .put_batch(&entries(&[("k1", "v1"), ("k2", "v2")]))
        .await
        .unwrap();
    store
        .delete_batch(&["k1".to_string(), "nope".to_string()])
        .await
        .unwrap();
    assert_eq!(store.get("k1").await.unwrap(), None);
    assert!(store.get("k2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_by_prefix() {
    let store = setup("uuid-a").await;
    store
        .put_batch(&entries(&[("dev#a#x", "1"), ("dev#a#y", "2"), ("dev#b#x", "3")]))
        .await
        .unwrap();
    store.delete_by_prefix("dev#a#").await.unwrap();
    let left = store.get_by_prefix("dev#").await.unwrap();
    assert_eq!(left.keys().collect::<Vec<_>>(), vec!["dev#b#x"]);
}

#[tokio::test]
async fn test_operations_fail_before_init() {
    let store = SqliteKvStore::in_memory("dp_kv_store", "uuid-a");
    assert!(matches!(
        store.get("k").await,
        Err(StorageError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_repeated_init_keeps_data() {
    let store = setup("uuid-a").await;
    store.put("dev#a#osType", "10").await.unwrap();

    store.init().await.unwrap();
    assert_eq!(store.get("dev#a#osType").await.unwrap().as_deref(), Some("10"));

    store.uninit().await.unwrap();
    store.init().await.unwrap();
    assert_eq!(store.get("dev#a#osType").await.unwrap(), None);
}

// ============================================================================
// Change notifications
// ============================================================================

#[tokio::test]
async fn test_changes_are_classified() {
    let store = setup("uuid-a").await;
    let mut rx = store.subscribe();

    store.put("k1", "v1").await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.store_id, "dp_kv_store");
    assert_eq!(first.inserts.len(), 1);
    assert!(first.updates.is_empty());

    store
        .put_batch(&entries(&[("k1", "v2"), ("k2", "v1")]))
        .await
        .unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(second.updates.len(), 1);
    assert_eq!(second.updates[0].value, "v2");
    assert_eq!(second.inserts.len(), 1);

    store.delete("k1").await.unwrap();
    let third = rx.recv().await.unwrap();
    assert_eq!(third.deletes.len(), 1);
    assert_eq!(third.deletes[0].value, "v2");
}

#[tokio::test]
async fn test_deleting_missing_key_publishes_nothing() {
    let store = setup("uuid-a").await;
    let mut rx = store.subscribe();
    store.delete("absent").await.unwrap();
    store.put("k", "v").await.unwrap();
    // The first notification received is the put, not an empty delete
    let next = rx.recv().await.unwrap();
    assert_eq!(next.inserts.len(), 1);
}

// ============================================================================
// Peer sync
// ============================================================================

#[tokio::test]
async fn test_push_pull_preserves_owner() {
    let local = setup("uuid-a").await;
    let peer = Arc::new(setup("uuid-b").await);
    local.link_peer("net-b", Arc::clone(&peer));

    local.put("dev#a#deviceName", "phone").await.unwrap();
    peer.put("dev#b#deviceName", "tablet").await.unwrap();

    let results = local
        .sync(&["net-b".to_string()], SyncMode::PushPull)
        .await
        .unwrap();
    assert_eq!(results.get("net-b"), Some(&SyncStatus::Succeeded));

    assert_eq!(
        peer.get("dev#a#deviceName").await.unwrap().as_deref(),
        Some("phone")
    );
    assert_eq!(
        local.get("dev#b#deviceName").await.unwrap().as_deref(),
        Some("tablet")
    );

    // Replicated entries keep their writer's owner
    let local_owned = local.get_by_owner("uuid-a").await.unwrap();
    assert_eq!(local_owned.len(), 1);
    let from_peer = local.get_by_owner("uuid-b").await.unwrap();
    assert!(from_peer.contains_key("dev#b#deviceName"));
}

#[tokio::test]
async fn test_push_only_does_not_pull() {
    let local = setup("uuid-a").await;
    let peer = Arc::new(setup("uuid-b").await);
    local.link_peer("net-b", Arc::clone(&peer));
    peer.put("dev#b#deviceName", "tablet").await.unwrap();

    local
        .sync(&["net-b".to_string()], SyncMode::Push)
        .await
        .unwrap();
    assert_eq!(local.get("dev#b#deviceName").await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_peer_reports_failure() {
    let local = setup("uuid-a").await;
    let results = local
        .sync(&["ghost".to_string()], SyncMode::PushPull)
        .await
        .unwrap();
    assert_eq!(results.get("ghost"), Some(&SyncStatus::Failed));
}
