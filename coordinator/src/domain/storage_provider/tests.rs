//! Read routing and cache invalidation behaviour.

use std::sync::atomic::AtomicUsize;

use rstest::{fixture, rstest};
use tokio::sync::Notify;

use super::*;
use crate::domain::ports::{
    MockConsistentStoragesGetter, MockStorageProviderMetrics, NoOpStorageProviderMetrics,
};

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

fn notification(payload: &str) -> Notification {
    Notification {
        channel: "storage_repositories_updates".to_owned(),
        payload: payload.to_owned(),
    }
}

#[fixture]
fn counting_getter() -> MockConsistentStoragesGetter {
    let mut getter = MockConsistentStoragesGetter::new();
    getter
        .expect_get_consistent_storages()
        .times(2)
        .returning(|_, _| Ok(set(&["gitaly-1", "gitaly-2"])));
    getter
}

#[tokio::test]
async fn primary_is_added_to_consistent_storages() {
    let mut getter = MockConsistentStoragesGetter::new();
    getter
        .expect_get_consistent_storages()
        .withf(|vs, path| vs == "default" && path == "a.git")
        .returning(|_, _| Ok(set(&["gitaly-2"])));
    let provider = DirectStorageProvider::new(Arc::new(getter), Arc::new(NoOpStorageProviderMetrics));

    let storages = provider.storages_for_read("default", "a.git", "gitaly-1").await;

    assert_eq!(storages, set(&["gitaly-1", "gitaly-2"]));
}

#[tokio::test]
async fn lookup_failure_falls_back_to_primary_and_is_counted() {
    let mut getter = MockConsistentStoragesGetter::new();
    getter
        .expect_get_consistent_storages()
        .returning(|_, _| Err(RepositoryStoreError::connection("db down")));
    let mut metrics = MockStorageProviderMetrics::new();
    metrics
        .expect_record_lookup_failure()
        .withf(|vs| vs == "default")
        .times(1)
        .returning(|_| Ok(()));
    let provider = DirectStorageProvider::new(Arc::new(getter), Arc::new(metrics));

    let storages = provider.storages_for_read("default", "a.git", "gitaly-1").await;

    assert_eq!(storages, set(&["gitaly-1"]));
}

#[rstest]
#[tokio::test]
async fn cache_is_bypassed_until_connected(counting_getter: MockConsistentStoragesGetter) {
    let cache = CachingStoragesGetter::new(Arc::new(counting_getter), DEFAULT_CACHE_CAPACITY);

    for _ in 0..2 {
        cache
            .get_consistent_storages("default", "a.git")
            .await
            .expect("lookup succeeds");
    }

    assert!(!cache.is_enabled());
}

#[rstest]
#[tokio::test]
async fn notification_evicts_touched_paths(counting_getter: MockConsistentStoragesGetter) {
    let cache = CachingStoragesGetter::new(Arc::new(counting_getter), DEFAULT_CACHE_CAPACITY);
    cache.connected();

    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("first lookup");
    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("cached lookup");

    cache.notification(&notification(
        r#"[{"virtual_storage": "default", "relative_paths": ["a.git"]}]"#,
    ));
    let storages = cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("lookup after eviction");

    assert_eq!(storages, set(&["gitaly-1", "gitaly-2"]));
}

#[rstest]
#[tokio::test]
async fn disconnect_clears_and_disables(counting_getter: MockConsistentStoragesGetter) {
    let cache = CachingStoragesGetter::new(Arc::new(counting_getter), DEFAULT_CACHE_CAPACITY);
    cache.connected();
    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("first lookup");

    cache.disconnect(&NotificationError::connection("reset"));
    assert!(!cache.is_enabled());
    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("lookup while disabled");
}

#[tokio::test]
async fn unrelated_notification_keeps_entries() {
    let mut getter = MockConsistentStoragesGetter::new();
    getter
        .expect_get_consistent_storages()
        .times(1)
        .returning(|_, _| Ok(set(&["gitaly-1"])));
    let cache = CachingStoragesGetter::new(Arc::new(getter), DEFAULT_CACHE_CAPACITY);
    cache.connected();

    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("first lookup");
    cache.notification(&notification(
        r#"{"old": null, "new": [{"virtual_storage": "default", "relative_path": "b.git"}]}"#,
    ));
    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("cached lookup");
}

#[rstest]
#[tokio::test]
async fn malformed_notification_clears_everything(counting_getter: MockConsistentStoragesGetter) {
    let cache = CachingStoragesGetter::new(Arc::new(counting_getter), DEFAULT_CACHE_CAPACITY);
    cache.connected();
    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("first lookup");

    cache.notification(&notification("garbage"));
    cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("lookup after clear");
}

/// Getter whose first lookup blocks until released; later lookups see only
/// the primary.
#[derive(Default)]
struct GatedGetter {
    calls: AtomicUsize,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl ConsistentStoragesGetter for GatedGetter {
    async fn get_consistent_storages(
        &self,
        _virtual_storage: &str,
        _relative_path: &str,
    ) -> Result<BTreeSet<String>, RepositoryStoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.notify_one();
            self.release.notified().await;
            return Ok(set(&["gitaly-1", "gitaly-2"]));
        }
        Ok(set(&["gitaly-1"]))
    }
}

#[tokio::test]
async fn lookup_racing_a_notification_is_not_cached() {
    let getter = Arc::new(GatedGetter::default());
    let cache = Arc::new(CachingStoragesGetter::new(
        Arc::clone(&getter),
        DEFAULT_CACHE_CAPACITY,
    ));
    cache.connected();

    let in_flight = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.get_consistent_storages("default", "a.git").await }
    });
    getter.started.notified().await;
    cache.notification(&notification(
        r#"[{"virtual_storage": "default", "relative_paths": ["a.git"]}]"#,
    ));
    getter.release.notify_one();

    let stale = in_flight
        .await
        .expect("lookup task")
        .expect("in-flight lookup");
    assert_eq!(stale, set(&["gitaly-1", "gitaly-2"]));
    assert_eq!(cache.len(), 0);

    let fresh = cache
        .get_consistent_storages("default", "a.git")
        .await
        .expect("lookup after notification");
    assert_eq!(fresh, set(&["gitaly-1"]));
    assert_eq!(getter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn full_cache_drops_the_least_recently_used_repository() {
    let mut getter = MockConsistentStoragesGetter::new();
    for (path, times) in [("a.git", 1), ("b.git", 2), ("c.git", 1)] {
        getter
            .expect_get_consistent_storages()
            .withf(move |_, relative_path| relative_path == path)
            .times(times)
            .returning(|_, _| Ok(set(&["gitaly-1"])));
    }
    let cache = CachingStoragesGetter::new(Arc::new(getter), 2);
    cache.connected();

    for path in ["a.git", "b.git", "a.git", "c.git", "a.git", "b.git"] {
        cache
            .get_consistent_storages("default", path)
            .await
            .expect("lookup");
    }

    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn zero_capacity_never_caches() {
    let mut getter = MockConsistentStoragesGetter::new();
    getter
        .expect_get_consistent_storages()
        .times(2)
        .returning(|_, _| Ok(set(&["gitaly-1"])));
    let cache = CachingStoragesGetter::new(Arc::new(getter), 0);
    cache.connected();

    for _ in 0..2 {
        cache
            .get_consistent_storages("default", "a.git")
            .await
            .expect("lookup");
    }
    assert_eq!(cache.len(), 0);
}
