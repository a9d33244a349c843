mod common;

use cachedimage::{ImagePhase, ImageReference, MemoryImageStore, PodReference, UsageTracker};
use common::{cache_image, days, pod, pod_reconciler, record, t0};
use controller::lifecycle::DEGRADED_AFTER_FAILURES;
use controller::{LifecycleConfig, LifecycleReconciler, Outcome};
use proxy::cache::{CacheKey, CacheStorage};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn name_of(image: &str) -> String {
    ImageReference::parse(image).unwrap().resource_name()
}

fn lifecycle(store: &Arc<MemoryImageStore>) -> LifecycleReconciler {
    LifecycleReconciler::new(store.clone(), None, LifecycleConfig::default())
}

#[tokio::test]
async fn test_deleted_pod_image_expires_after_delay() {
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let lifecycle = lifecycle(&store);
    let name = name_of("nginx:1.25");

    pods.apply_at(&pod("ns", "p1", &["nginx:1.25"]), t0()).await.unwrap();
    pods.release_at(&PodReference::new("ns", "p1"), t0()).await.unwrap();

    // Unowned right away, but kept until the delay has passed
    let status = record(&store, "nginx:1.25").await.unwrap().status.unwrap();
    assert!(status.owners.is_empty());

    let outcome = lifecycle.reconcile_at(&name, t0() + days(1)).await.unwrap();
    assert_eq!(outcome, Outcome::Kept { requeue_after: Duration::from_secs(3600) });

    let outcome = lifecycle
        .reconcile_at(&name, t0() + days(30) - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Kept { requeue_after: Duration::from_secs(1) });
    assert!(record(&store, "nginx:1.25").await.is_some());

    let outcome = lifecycle.reconcile_at(&name, t0() + days(30)).await.unwrap();
    assert_eq!(outcome, Outcome::Deleted { eviction: None });
    assert!(record(&store, "nginx:1.25").await.is_none());

    // Level-triggered: a later pass on the deleted record is harmless
    assert_eq!(lifecycle.reconcile_at(&name, t0() + days(31)).await.unwrap(), Outcome::Gone);
}

#[tokio::test]
async fn test_owned_record_is_never_deleted() {
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let lifecycle = lifecycle(&store);

    pods.apply_at(&pod("ns", "p1", &["nginx:1.25"]), t0()).await.unwrap();

    let outcome = lifecycle
        .reconcile_at(&name_of("nginx:1.25"), t0() + days(3650))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Kept { requeue_after: Duration::from_secs(3600) });
    let status = record(&store, "nginx:1.25").await.unwrap().status.unwrap();
    assert!(status.expires_at.is_none());
}

#[tokio::test]
async fn test_new_owner_cancels_expiry() {
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let lifecycle = lifecycle(&store);
    let name = name_of("nginx:1.25");

    pods.apply_at(&pod("ns", "p1", &["nginx:1.25"]), t0()).await.unwrap();
    pods.release_at(&PodReference::new("ns", "p1"), t0()).await.unwrap();
    pods.apply_at(&pod("ns", "p2", &["nginx:1.25"]), t0() + days(10)).await.unwrap();

    let outcome = lifecycle.reconcile_at(&name, t0() + days(40)).await.unwrap();
    assert!(matches!(outcome, Outcome::Kept { .. }));
    let current = record(&store, "nginx:1.25").await.unwrap();
    assert_eq!(current.phase(), ImagePhase::Pending);
    assert!(current.status.unwrap().expires_at.is_none());
}

#[tokio::test]
async fn test_proxy_only_record_expires_from_first_pass() {
    let store = Arc::new(MemoryImageStore::new());
    let tracker = UsageTracker::new(store.clone(), 3);
    let lifecycle = lifecycle(&store);
    let image = ImageReference::parse("quay.io/org/tool:v1").unwrap();
    let name = image.resource_name();

    tracker.mark_cached(&image, "sha256:aaaa").await.unwrap();

    let outcome = lifecycle.reconcile_at(&name, t0()).await.unwrap();
    assert!(matches!(outcome, Outcome::Kept { .. }));
    let status = store_status(&store, &name).await;
    assert_eq!(status.phase, ImagePhase::Cached);
    assert_eq!(status.expires_at, Some(t0() + days(30)));

    // Pulls refresh the access time, not the deadline
    tracker.mark_cached(&image, "sha256:aaaa").await.unwrap();
    assert_eq!(store_status(&store, &name).await.expires_at, Some(t0() + days(30)));

    let outcome = lifecycle.reconcile_at(&name, t0() + days(30)).await.unwrap();
    assert!(matches!(outcome, Outcome::Deleted { .. }));
}

async fn store_status(store: &MemoryImageStore, name: &str) -> cachedimage::CachedImageStatus {
    use cachedimage::ImageStore;
    store.get(name).await.unwrap().unwrap().status.unwrap()
}

#[tokio::test]
async fn test_requeue_follows_deadline_under_cap() {
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let config = LifecycleConfig {
        max_requeue_secs: 7 * 24 * 3600,
        ..LifecycleConfig::default()
    };
    let lifecycle = LifecycleReconciler::new(store.clone(), None, config);

    pods.apply_at(&pod("ns", "p1", &["nginx:1.25"]), t0()).await.unwrap();
    pods.release_at(&PodReference::new("ns", "p1"), t0()).await.unwrap();

    let outcome = lifecycle
        .reconcile_at(&name_of("nginx:1.25"), t0() + days(29))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Kept { requeue_after: Duration::from_secs(24 * 3600) });
}

#[tokio::test]
async fn test_pass_survives_conflicting_writers() {
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let lifecycle = lifecycle(&store);

    pods.apply_at(&pod("ns", "p1", &["nginx:1.25"]), t0()).await.unwrap();
    pods.release_at(&PodReference::new("ns", "p1"), t0()).await.unwrap();
    store.inject_conflicts(3);

    let outcome = lifecycle
        .reconcile_at(&name_of("nginx:1.25"), t0() + days(31))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Deleted { .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_persistent_failures_mark_record_degraded() {
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let lifecycle = lifecycle(&store);
    let name = name_of("nginx:1.25");
    pods.apply_at(&pod("ns", "p1", &["nginx:1.25"]), t0()).await.unwrap();

    let mut streak = 0;
    for _ in 0..DEGRADED_AFTER_FAILURES {
        streak = lifecycle.record_pass_failure(&name).0;
    }
    assert_eq!(streak, DEGRADED_AFTER_FAILURES);
    lifecycle.mark_degraded(&name, "pass timed out").await.unwrap();

    let current = record(&store, "nginx:1.25").await.unwrap();
    assert_eq!(current.phase(), ImagePhase::Pending);
    assert_eq!(current.status.unwrap().last_error.as_deref(), Some("pass timed out"));

    // A successful pass starts the streak over
    lifecycle.record_pass_success(&name);
    assert_eq!(lifecycle.record_pass_failure(&name), (1, Duration::from_secs(5)));
}

#[tokio::test]
async fn test_deletion_evicts_unshared_cache_content() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(CacheStorage::new(dir.path().to_path_buf()).unwrap());
    let store = Arc::new(MemoryImageStore::new());
    let pods = pod_reconciler(&store);
    let lifecycle = LifecycleReconciler::new(store.clone(), Some(cache.clone()), LifecycleConfig::default());

    let shared_layer = b"debian base layer";
    let (old_config, shared) = cache_image(&cache, "docker.io/org/app:v1", shared_layer).await;
    let (new_config, _) = cache_image(&cache, "docker.io/org/app:v2", shared_layer).await;

    pods.apply_at(&pod("ns", "old", &["org/app:v1"]), t0()).await.unwrap();
    pods.apply_at(&pod("ns", "new", &["org/app:v2"]), t0()).await.unwrap();
    pods.release_at(&PodReference::new("ns", "old"), t0()).await.unwrap();

    let outcome = lifecycle
        .reconcile_at(&name_of("org/app:v1"), t0() + days(30))
        .await
        .unwrap();
    let Outcome::Deleted { eviction: Some(report) } = outcome else {
        panic!("expected a deletion with eviction, got {:?}", outcome);
    };
    assert!(report.removed_files > 0);

    let v1 = ImageReference::parse("org/app:v1").unwrap();
    let v2 = ImageReference::parse("org/app:v2").unwrap();
    assert!(!cache.has(&CacheKey::Manifest(v1)).await);
    assert!(!cache.has(&CacheKey::Blob(old_config)).await);
    assert!(cache.has(&CacheKey::Blob(shared)).await);
    assert!(cache.has(&CacheKey::Manifest(v2)).await);
    assert!(cache.has(&CacheKey::Blob(new_config)).await);
}
