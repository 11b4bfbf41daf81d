use std::time::SystemTime;

use tokio::time::sleep;
use tokio::time::Duration;

use super::*;
use crate::Error;
use crate::StorageConfig;

fn storage() -> MemoryStorage {
    MemoryStorage::new(&StorageConfig::default())
}

async fn next_event(watcher: &mut Watcher) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(60), watcher.next())
        .await
        .expect("event should arrive")
        .expect("watcher should stay open")
}

#[tokio::test(start_paused = true)]
async fn test_set_then_get_returns_value_and_full_ttl() {
    let config = StorageConfig::default();
    let storage = MemoryStorage::new(&config);

    let written_at = SystemTime::now();
    storage.set("/registry/svc-a", "10.0.0.1:9000").await.unwrap();

    let node = storage.get("/registry/svc-a").await.unwrap();
    assert_eq!(node.key(), "/registry/svc-a");
    assert_eq!(node.value(), Some("10.0.0.1:9000"));
    assert!(!node.is_dir());
    assert_eq!(node.ttl(), Some(20));
    let expected = written_at + config.lease.heartbeat_delay();
    let expiration = node.expiration().unwrap();
    let drift = expiration
        .duration_since(expected)
        .unwrap_or_else(|e| e.duration());
    assert!(drift <= Duration::from_secs(1), "expiration off by {drift:?}");
    assert_eq!(node.created_index(), node.modified_index());
    assert_eq!(storage.current_index(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_counts_down_until_key_expires() {
    let storage = storage();
    storage.set("/registry/svc-a", "v").await.unwrap();
    let expiration = storage.get("/registry/svc-a").await.unwrap().expiration();

    sleep(Duration::from_secs(5)).await;
    let node = storage.get("/registry/svc-a").await.unwrap();
    assert_eq!(node.ttl(), Some(15));
    assert_eq!(node.expiration(), expiration);

    sleep(Duration::from_secs(16)).await;
    let err = storage.get("/registry/svc-a").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_update_refreshes_lease_and_keeps_creation_index() {
    let storage = storage();
    storage.set("/registry/svc-a", "v1").await.unwrap();
    let created = storage.get("/registry/svc-a").await.unwrap().created_index();

    sleep(Duration::from_secs(15)).await;
    storage.update("/registry/svc-a", "v2").await.unwrap();
    sleep(Duration::from_secs(10)).await;

    let node = storage.get("/registry/svc-a").await.unwrap();
    assert_eq!(node.value(), Some("v2"));
    assert_eq!(node.ttl(), Some(10));
    assert_eq!(node.created_index(), created);
    assert!(node.modified_index() > created);
}

#[tokio::test(start_paused = true)]
async fn test_update_of_missing_key_is_not_found() {
    let storage = storage();

    let err = storage.update("/registry/ghost", "v").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { key } if key == "/registry/ghost"));
}

#[tokio::test(start_paused = true)]
async fn test_update_after_delete_does_not_recreate() {
    let storage = storage();
    storage.set("/registry/svc-a", "v").await.unwrap();
    storage.delete("/registry/svc-a").await.unwrap();

    assert!(storage.update("/registry/svc-a", "v").await.unwrap_err().is_not_found());
    assert!(storage.get("/registry/svc-a").await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_update_after_expiry_is_not_found() {
    let storage = storage();
    storage.set("/registry/svc-a", "v").await.unwrap();

    sleep(Duration::from_secs(21)).await;

    assert!(storage.update("/registry/svc-a", "v").await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_get_directory_assembles_subtree() {
    let storage = storage();
    storage.set("/registry/a", "1").await.unwrap();
    storage.set("/registry/b/c", "2").await.unwrap();
    storage.set("/registry/b/d", "3").await.unwrap();

    let root = storage.get("/registry").await.unwrap();
    assert!(root.is_dir());
    assert_eq!(root.value(), None);
    assert_eq!(root.created_index(), 1);
    assert_eq!(root.modified_index(), 3);

    let keys: Vec<&str> = root.nodes().iter().map(|n| n.key()).collect();
    assert_eq!(keys, vec!["/registry/a", "/registry/b"]);

    let b = root.find("/registry/b").unwrap();
    assert!(b.is_dir());
    assert_eq!(b.nodes().len(), 2);
    assert_eq!(
        root.find("/registry/b/d").and_then(|n| n.value()),
        Some("3")
    );
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_normalised() {
    let storage = storage();
    storage.set("registry//svc-a/", "v").await.unwrap();

    let node = storage.get("/registry/svc-a").await.unwrap();
    assert_eq!(node.key(), "/registry/svc-a");
    assert!(matches!(
        storage.get("/registry/../etc").await.unwrap_err(),
        Error::InvalidKey { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_recursive_delete_removes_whole_subtree() {
    let storage = storage();
    storage.set("/registry/a", "1").await.unwrap();
    storage.set("/registry/b/c", "2").await.unwrap();
    storage.set("/registry-other", "3").await.unwrap();

    storage.delete("/registry").await.unwrap();

    assert!(storage.get("/registry").await.unwrap_err().is_not_found());
    assert!(storage.get("/registry/b/c").await.unwrap_err().is_not_found());
    assert_eq!(
        storage.get("/registry-other").await.unwrap().value(),
        Some("3")
    );
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_missing_key_is_not_found() {
    let storage = storage();

    assert!(storage.delete("/registry").await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_set_conflicts_with_hierarchy() {
    let storage = storage();
    storage.set("/registry/a/b", "v").await.unwrap();

    assert!(matches!(
        storage.set("/registry/a", "v").await.unwrap_err(),
        Error::NotAFile { key } if key == "/registry/a"
    ));
    assert!(matches!(
        storage.update("/registry/a", "v").await.unwrap_err(),
        Error::NotAFile { .. }
    ));
    assert!(matches!(
        storage.set("/registry/a/b/c", "v").await.unwrap_err(),
        Error::NotADirectory { key } if key == "/registry/a/b"
    ));
    assert!(storage.set("/", "v").await.unwrap_err().is_conflict());
}

#[tokio::test(start_paused = true)]
async fn test_watch_from_now_sees_changes_in_order() {
    let storage = storage();
    storage.set("/registry/old", "v").await.unwrap();
    let mut watcher = storage.watch("/registry", 0).await.unwrap();

    storage.set("/registry/svc-a", "v1").await.unwrap();
    storage.set("/registry/svc-a", "v2").await.unwrap();
    storage.delete("/registry/svc-a").await.unwrap();

    let set = next_event(&mut watcher).await;
    assert_eq!(set.action, WatchAction::Set);
    assert_eq!(set.node.value(), Some("v1"));
    assert!(set.prev_node.is_none());

    let update = next_event(&mut watcher).await;
    assert_eq!(update.action, WatchAction::Update);
    assert_eq!(update.prev_node.as_ref().and_then(|n| n.value()), Some("v1"));

    let delete = next_event(&mut watcher).await;
    assert_eq!(delete.action, WatchAction::Delete);
    assert_eq!(delete.node.value(), None);
    assert_eq!(delete.index(), 4);

    assert!(watcher.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watch_ignores_sibling_prefixes() {
    let storage = storage();
    let mut watcher = storage.watch("/registry", 0).await.unwrap();

    storage.set("/registry-other/a", "x").await.unwrap();
    storage.set("/registry/a", "y").await.unwrap();

    let event = next_event(&mut watcher).await;
    assert_eq!(event.key(), "/registry/a");
    assert!(watcher.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_last_index_delivers_each_change_once() {
    let storage = storage();
    let mut first = storage.watch("/registry", 0).await.unwrap();
    for i in 0..3 {
        storage.set(&format!("/registry/svc-{i}"), "v").await.unwrap();
    }
    for _ in 0..3 {
        next_event(&mut first).await;
    }
    let resume_from = first.last_index();
    first.stop();

    for i in 3..6 {
        storage.set(&format!("/registry/svc-{i}"), "v").await.unwrap();
    }

    let mut second = storage.watch("/registry", resume_from).await.unwrap();
    storage.set("/registry/svc-6", "v").await.unwrap();

    let mut indices = Vec::new();
    for _ in 0..4 {
        indices.push(next_event(&mut second).await.index());
    }
    assert_eq!(indices, vec![4, 5, 6, 7]);
    assert!(second.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watch_from_future_index_skips_until_reached() {
    let storage = storage();
    storage.set("/registry/a", "v").await.unwrap();
    let mut watcher = storage.watch("/registry", 2).await.unwrap();

    storage.set("/registry/a", "v").await.unwrap();
    storage.set("/registry/a", "v").await.unwrap();

    assert_eq!(next_event(&mut watcher).await.index(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_watch_from_cleared_index_fails() {
    let mut config = StorageConfig::default();
    config.watch.history_size = 2;
    let storage = MemoryStorage::new(&config);
    for i in 0..5 {
        storage.set(&format!("/registry/svc-{i}"), "v").await.unwrap();
    }

    let err = storage.watch("/registry", 1).await.unwrap_err();
    assert!(matches!(err, Error::SubscriptionFailure { .. }));

    let mut watcher = storage.watch("/registry", 3).await.unwrap();
    assert_eq!(next_event(&mut watcher).await.index(), 4);
    assert_eq!(next_event(&mut watcher).await.index(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_recursive_delete_emits_event_per_leaf() {
    let storage = storage();
    storage.set("/registry/a", "1").await.unwrap();
    storage.set("/registry/b/c", "2").await.unwrap();
    let mut watcher = storage.watch("/registry", 0).await.unwrap();

    storage.delete("/registry").await.unwrap();

    let first = next_event(&mut watcher).await;
    let second = next_event(&mut watcher).await;
    assert_eq!(first.key(), "/registry/a");
    assert_eq!(second.key(), "/registry/b/c");
    assert_eq!(first.index(), second.index());
    assert!([first.action, second.action]
        .iter()
        .all(|a| *a == WatchAction::Delete));
}

#[tokio::test(start_paused = true)]
async fn test_lease_expiry_is_reported_to_watchers() {
    let storage = storage();
    let mut watcher = storage.watch("/registry", 0).await.unwrap();
    storage.set("/registry/svc-a", "v").await.unwrap();
    next_event(&mut watcher).await;

    // The background sweep fires without further calls.
    let event = next_event(&mut watcher).await;
    assert_eq!(event.action, WatchAction::Expire);
    assert_eq!(event.key(), "/registry/svc-a");
    assert_eq!(
        event.prev_node.as_ref().and_then(|n| n.value()),
        Some("v")
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_does_not_wait_and_blocks_further_delivery() {
    let storage = storage();
    let mut watcher = storage.watch("/registry", 0).await.unwrap();
    for i in 0..50 {
        storage.set(&format!("/registry/svc-{i}"), "v").await.unwrap();
    }

    watcher.stop();
    storage.set("/registry/late", "v").await.unwrap();

    let mut drained = 0;
    while let Some(event) = watcher.next().await {
        assert_ne!(event.key(), "/registry/late");
        drained += 1;
    }
    assert_eq!(drained, 50);
    assert_eq!(storage.watcher_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_overflows() {
    let mut config = StorageConfig::default();
    config.watch.buffer_size = 2;
    let storage = MemoryStorage::new(&config);
    let mut watcher = storage.watch("/registry", 0).await.unwrap();

    for i in 0..3 {
        storage.set(&format!("/registry/svc-{i}"), "v").await.unwrap();
    }

    assert!(watcher.overflowed());
    assert_eq!(watcher.state(), WatcherState::Closed);
    assert_eq!(next_event(&mut watcher).await.index(), 1);
    assert_eq!(next_event(&mut watcher).await.index(), 2);
    assert!(watcher.next().await.is_none());
    assert_eq!(storage.watcher_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_overflow_recovers_whole_recursive_delete() {
    let mut config = StorageConfig::default();
    config.watch.buffer_size = 1;
    let storage = MemoryStorage::new(&config);
    for leaf in ["a", "b", "c"] {
        storage.set(&format!("/r/{leaf}"), "v").await.unwrap();
    }
    let mut first = storage.watch("/r", 0).await.unwrap();

    storage.set("/r/d", "v").await.unwrap();
    storage.delete("/r").await.unwrap();

    assert!(first.overflowed());
    assert_eq!(next_event(&mut first).await.key(), "/r/d");
    assert!(first.next().await.is_none());
    let resume_from = first.last_index();
    assert_eq!(resume_from, 4);

    let mut second = storage.watch("/r", resume_from).await.unwrap();
    let mut removed = Vec::new();
    for _ in 0..4 {
        let event = next_event(&mut second).await;
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.index(), 5);
        removed.push(event.key().to_string());
    }
    assert_eq!(removed, vec!["/r/a", "/r/b", "/r/c", "/r/d"]);
    assert_eq!(second.last_index(), 5);
    assert!(second.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_recursive_delete_larger_than_queue_is_delivered() {
    let mut config = StorageConfig::default();
    config.watch.buffer_size = 1;
    let storage = MemoryStorage::new(&config);
    for leaf in ["a", "b", "c"] {
        storage.set(&format!("/r/{leaf}"), "v").await.unwrap();
    }
    let mut watcher = storage.watch("/r", 0).await.unwrap();

    storage.delete("/r").await.unwrap();

    for leaf in ["a", "b", "c"] {
        assert_eq!(next_event(&mut watcher).await.key(), format!("/r/{leaf}"));
    }
    assert!(!watcher.overflowed());
    assert_eq!(watcher.state(), WatcherState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_watcher_leaves_active_count_at_once() {
    let storage = storage();
    let watcher = storage.watch("/registry", 0).await.unwrap();
    assert!(watcher.is_counted());

    watcher.stop();
    assert!(!watcher.is_counted());

    let _other = storage.watch("/registry", 0).await.unwrap();
    assert_eq!(storage.watcher_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rewritten_key_expires_once_on_latest_lease() {
    let storage = storage();
    let mut watcher = storage.watch("/registry", 0).await.unwrap();
    storage.set("/registry/svc-a", "v1").await.unwrap();
    storage.set("/registry/svc-a", "v2").await.unwrap();

    sleep(Duration::from_secs(10)).await;
    storage.delete("/registry/svc-a").await.unwrap();
    storage.set("/registry/svc-a", "v3").await.unwrap();

    // Well past the first lease, short of the second.
    sleep(Duration::from_secs(15)).await;
    assert_eq!(
        storage.get("/registry/svc-a").await.unwrap().value(),
        Some("v3")
    );

    sleep(Duration::from_secs(7)).await;
    assert!(storage.get("/registry/svc-a").await.unwrap_err().is_not_found());

    let mut actions = Vec::new();
    while let Some(event) = watcher.try_next() {
        actions.push(event.action);
    }
    assert_eq!(
        actions,
        vec![
            WatchAction::Set,
            WatchAction::Update,
            WatchAction::Delete,
            WatchAction::Set,
            WatchAction::Expire,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_registry_listing_drops_silent_instances() {
    let storage = storage();
    storage.set("/services/web/10.0.0.1", "10.0.0.1:80").await.unwrap();
    storage.set("/services/web/10.0.0.2", "10.0.0.2:80").await.unwrap();

    for _ in 0..3 {
        sleep(Duration::from_secs(10)).await;
        storage.update("/services/web/10.0.0.1", "10.0.0.1:80").await.unwrap();
    }

    let web = storage.get("/services/web").await.unwrap();
    let alive: Vec<&str> = web.leaves().iter().filter_map(|n| n.value()).collect();
    assert_eq!(alive, vec!["10.0.0.1:80"]);
}

#[tokio::test(start_paused = true)]
async fn test_elapsed_lease_is_refreshable_until_swept() {
    let storage = storage();
    sleep(Duration::from_millis(500)).await;
    storage.set("/registry/svc-a", "v").await.unwrap();
    let first = storage.get("/registry/svc-a").await.unwrap().expiration().unwrap();

    // Lease elapsed at 20.5s, next sweep runs at 21s.
    sleep(Duration::from_millis(20_200)).await;
    assert_eq!(storage.get("/registry/svc-a").await.unwrap().ttl(), Some(0));

    storage.update("/registry/svc-a", "v").await.unwrap();
    let refreshed = storage.get("/registry/svc-a").await.unwrap();
    assert_eq!(refreshed.ttl(), Some(20));
    assert!(refreshed.expiration().unwrap() > first);
}
