mod common;

use bytes::Bytes;
use cachedimage::ImageReference;
use common::TestImage;
use futures::{stream, StreamExt};
use proxy::cache::{sha256_digest, CacheKey, CacheStorage, SingleFlight};
use proxy::ProxyError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn storage() -> (TempDir, Arc<CacheStorage>) {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(CacheStorage::new(dir.path().to_path_buf()).unwrap());
    (dir, cache)
}

fn image(reference: &str) -> ImageReference {
    ImageReference::parse(reference).unwrap()
}

/// Write a test image's manifest under its tag, and its blobs
async fn store_image(cache: &CacheStorage, test_image: &TestImage) -> ImageReference {
    let reference = image(&format!("mock.local/{}:{}", test_image.repository, test_image.tag));
    cache
        .put(&CacheKey::Manifest(reference.clone()), test_image.manifest.clone())
        .await
        .unwrap();
    for (digest, data) in &test_image.blobs {
        cache.put(&CacheKey::Blob(digest.clone()), data.clone()).await.unwrap();
    }
    reference
}

#[tokio::test]
async fn test_blob_put_get_and_idempotent_put() {
    let (_dir, cache) = storage();
    let data = Bytes::from_static(b"layer contents");
    let key = CacheKey::Blob(sha256_digest(&data));

    assert!(!cache.has(&key).await);
    assert!(cache.get(&key).await.unwrap().is_none());

    cache.put(&key, data.clone()).await.unwrap();
    cache.put(&key, data.clone()).await.unwrap();

    assert!(cache.has(&key).await);
    assert_eq!(cache.get(&key).await.unwrap(), Some(data));
}

#[tokio::test]
async fn test_blob_with_wrong_digest_is_rejected() {
    let (_dir, cache) = storage();
    let key = CacheKey::Blob(sha256_digest(b"expected"));

    let err = cache.put(&key, Bytes::from_static(b"something else")).await.unwrap_err();
    assert!(matches!(err, ProxyError::Registry(_)), "got {:?}", err);
    assert!(!cache.has(&key).await);
}

#[tokio::test]
async fn test_malformed_digest_is_rejected() {
    let (_dir, cache) = storage();
    let key = CacheKey::Blob("sha256:../../etc/passwd".to_string());

    let err = cache.put(&key, Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, ProxyError::InvalidReference(_)));
}

#[tokio::test]
async fn test_manifest_lookup_by_tag_and_digest() {
    let (_dir, cache) = storage();
    let test_image = TestImage::new("team/app", "v1", b"layer-1");
    let tagged = store_image(&cache, &test_image).await;

    let by_tag = cache.lookup_manifest(&tagged).await.unwrap().unwrap();
    assert_eq!(by_tag.body, test_image.manifest);
    assert_eq!(by_tag.metadata.digest, test_image.manifest_digest);
    assert_eq!(by_tag.metadata.content_type, common::MANIFEST_TYPE);

    let by_digest = image(&format!("mock.local/team/app@{}", test_image.manifest_digest));
    assert_eq!(
        cache.get(&CacheKey::Manifest(by_digest)).await.unwrap(),
        Some(test_image.manifest.clone())
    );

    // Same repository name on another registry is a different image
    let elsewhere = image("other.local/team/app:v1");
    assert!(!cache.has(&CacheKey::Manifest(elsewhere)).await);
}

#[tokio::test]
async fn test_manifest_digest_reference_must_match_content() {
    let (_dir, cache) = storage();
    let test_image = TestImage::new("app", "v1", b"layer");
    let wrong = image(&format!("mock.local/app@{}", sha256_digest(b"not the manifest")));

    assert!(cache
        .put(&CacheKey::Manifest(wrong.clone()), test_image.manifest.clone())
        .await
        .is_err());
    assert!(!cache.has(&CacheKey::Manifest(wrong)).await);
}

#[tokio::test]
async fn test_evicting_tag_keeps_manifest_by_digest() {
    let (_dir, cache) = storage();
    let test_image = TestImage::new("app", "v1", b"layer");
    let tagged = store_image(&cache, &test_image).await;
    let by_digest = image(&format!("mock.local/app@{}", test_image.manifest_digest));

    assert!(cache.evict(&CacheKey::Manifest(tagged.clone())).await.unwrap());
    assert!(!cache.has(&CacheKey::Manifest(tagged.clone())).await);
    assert!(cache.has(&CacheKey::Manifest(by_digest)).await);

    // Second eviction finds nothing
    assert!(!cache.evict(&CacheKey::Manifest(tagged)).await.unwrap());
}

#[tokio::test]
async fn test_empty_blob_file_is_treated_as_absent() {
    let (_dir, cache) = storage();
    let digest = sha256_digest(b"payload");
    let path = cache.blob_path(&digest).unwrap();
    std::fs::write(&path, b"").unwrap();

    assert!(cache.blob_size(&digest).await.unwrap().is_none());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_streamed_blob_with_wrong_digest_leaves_no_file() {
    let (dir, cache) = storage();
    let digest = sha256_digest(b"the real content");
    let chunks = stream::iter(vec![
        Ok::<_, ProxyError>(Bytes::from_static(b"the fake ")),
        Ok(Bytes::from_static(b"content")),
    ]);

    assert!(cache.write_blob_stream(&digest, chunks).await.is_err());
    assert!(!cache.has(&CacheKey::Blob(digest)).await);

    let leftovers = std::fs::read_dir(dir.path().join("blobs").join("sha256"))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_interrupted_stream_leaves_no_file() {
    let (_dir, cache) = storage();
    let digest = sha256_digest(b"first half second half");
    let chunks = stream::iter(vec![
        Ok(Bytes::from_static(b"first half")),
        Err(ProxyError::UpstreamUnavailable("connection reset".to_string())),
    ]);

    let err = cache.write_blob_stream(&digest, chunks).await.unwrap_err();
    assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
    assert!(cache.blob_size(&digest).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_temp_files_removed_on_open() {
    let dir = TempDir::new().unwrap();
    let blobs = dir.path().join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs).unwrap();
    std::fs::write(blobs.join("abc.123.0.tmp"), b"partial").unwrap();

    let _cache = CacheStorage::new(dir.path().to_path_buf()).unwrap();
    assert!(!blobs.join("abc.123.0.tmp").exists());
}

#[tokio::test]
async fn test_concurrent_fills_share_one_fetch() {
    let fills = Arc::new(SingleFlight::<u64>::new());
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let fills = fills.clone();
        let fetches = fetches.clone();
        handles.push(tokio::spawn(async move {
            fills
                .run("sha256:shared", move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(42u64)
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 42);
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(fills.in_flight().await, 0);
}

#[tokio::test]
async fn test_fill_error_is_replayed_to_every_waiter() {
    let fills = Arc::new(SingleFlight::<u64>::new());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let fills = fills.clone();
        handles.push(tokio::spawn(async move {
            fills
                .run("sha256:broken", || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<u64, _>(ProxyError::NotFound("blob unknown upstream".to_string()))
                })
                .await
        }));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)), "got {:?}", err);
    }

    // A later call runs a fresh fill
    let value = fills
        .run("sha256:broken", || async { Ok(7u64) })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

type Chunk = Result<Bytes, ProxyError>;

/// Upstream body fed chunk by chunk from the test
fn channel_body() -> (tokio::sync::mpsc::Sender<Chunk>, impl futures::Stream<Item = Chunk> + Send + 'static) {
    let (tx, rx) = tokio::sync::mpsc::channel::<Chunk>(4);
    let body = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
    (tx, body)
}

#[tokio::test]
async fn test_blob_can_be_followed_while_written() {
    let (_dir, cache) = storage();
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let digest = sha256_digest(&data);
    let (tx, body) = channel_body();

    let fill = cache
        .start_blob_fill(&digest, Some(data.len() as u64), body)
        .await
        .unwrap();
    assert!(cache.blob_in_progress(&digest).is_some());
    let mut follower = Box::pin(fill.follow().await.unwrap().unwrap());

    tx.send(Ok(Bytes::copy_from_slice(&data[..1000]))).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), follower.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    // The final byte written so far is held back until verification
    assert_eq!(&first[..], &data[..999]);
    assert!(cache.blob_size(&digest).await.unwrap().is_none());

    tx.send(Ok(Bytes::copy_from_slice(&data[1000..]))).await.unwrap();
    drop(tx);

    let mut received = first.to_vec();
    while let Some(chunk) = follower.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(received, data);
    assert_eq!(fill.finished().await.unwrap(), data.len() as u64);
    assert_eq!(cache.blob_size(&digest).await.unwrap(), Some(data.len() as u64));
}

#[tokio::test]
async fn test_followers_see_failed_fill_as_error() {
    let (dir, cache) = storage();
    let digest = sha256_digest(b"genuine layer bytes");
    let (tx, body) = channel_body();

    let fill = cache.start_blob_fill(&digest, None, body).await.unwrap();
    let follower = fill.follow().await.unwrap().unwrap();

    tx.send(Ok(Bytes::from_static(b"forged layer bytes!"))).await.unwrap();
    drop(tx);

    let items: Vec<_> = follower.collect().await;
    assert!(items.last().unwrap().is_err());
    let served: usize = items.iter().filter_map(|item| item.as_ref().ok()).map(Bytes::len).sum();
    assert!(served < b"forged layer bytes!".len());

    let err = fill.finished().await.unwrap_err();
    assert!(matches!(err, ProxyError::Registry(_)), "got {:?}", err);
    assert!(!cache.has(&CacheKey::Blob(digest.clone())).await);

    // Unregistered right after the failure is published
    for _ in 0..50 {
        if cache.blob_in_progress(&digest).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cache.blob_in_progress(&digest).is_none());
    let leftovers = std::fs::read_dir(dir.path().join("blobs").join("sha256"))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_eviction_keeps_layers_shared_with_survivors() {
    let (_dir, cache) = storage();
    let shared_layer = b"shared base layer";
    let expired_image = TestImage::new("app", "v1", shared_layer);
    let surviving_image = TestImage::new("app", "v2", shared_layer);

    let expired = store_image(&cache, &expired_image).await;
    let survivor = store_image(&cache, &surviving_image).await;

    let report = cache
        .evict_unreferenced(&expired, &[expired.clone(), survivor.clone()])
        .await
        .unwrap();
    assert!(report.removed_files > 0);
    assert!(report.freed_bytes > 0);

    // The expired image is gone, including its own config blob
    assert!(!cache.has(&CacheKey::Manifest(expired)).await);
    assert!(!cache.has(&CacheKey::Blob(expired_image.blobs[0].0.clone())).await);

    // The shared layer and the survivor stay whole
    assert!(cache.has(&CacheKey::Blob(expired_image.layer_digest().to_string())).await);
    assert!(cache.has(&CacheKey::Manifest(survivor.clone())).await);
    for (digest, _) in &surviving_image.blobs {
        assert!(cache.has(&CacheKey::Blob(digest.clone())).await);
    }
}

#[tokio::test]
async fn test_eviction_of_uncached_image_is_a_noop() {
    let (_dir, cache) = storage();
    let report = cache
        .evict_unreferenced(&image("mock.local/never/pulled:1"), &[])
        .await
        .unwrap();
    assert_eq!(report.removed_files, 0);
    assert_eq!(report.freed_bytes, 0);
}
