#![allow(dead_code)]

use bytes::Bytes;
use cachedimage::{ImageStore, MemoryImageStore};
use chrono::{DateTime, TimeZone, Utc};
use controller::{LifecycleConfig, PodReconciler, PodsConfig};
use k8s_openapi::api::core::v1::Pod;
use proxy::cache::{sha256_digest, CacheKey, CacheStorage};
use serde_json::json;
use std::sync::Arc;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn days(n: i64) -> chrono::Duration {
    chrono::Duration::days(n)
}

pub fn pod(namespace: &str, name: &str, images: &[&str]) -> Pod {
    let containers: Vec<_> = images
        .iter()
        .enumerate()
        .map(|(i, image)| json!({"name": format!("c{}", i), "image": image}))
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"namespace": namespace, "name": name},
        "spec": {"containers": containers}
    }))
    .unwrap()
}

pub fn with_phase(mut pod: Pod, phase: &str) -> Pod {
    let mut status = pod.status.take().unwrap_or_default();
    status.phase = Some(phase.to_string());
    pod.status = Some(status);
    pod
}

pub fn pod_reconciler(store: &Arc<MemoryImageStore>) -> PodReconciler {
    PodReconciler::new(
        store.clone(),
        PodsConfig::default(),
        LifecycleConfig::default().expiry_delay(),
        vec!["localhost:8082".to_string(), "127.0.0.1:8082".to_string()],
    )
}

pub async fn record(store: &MemoryImageStore, image: &str) -> Option<cachedimage::CachedImage> {
    let name = cachedimage::ImageReference::parse(image).unwrap().resource_name();
    store.get(&name).await.unwrap()
}

/// Cache a single-layer image under `image`; returns (config digest, layer digest)
pub async fn cache_image(cache: &CacheStorage, image: &str, layer: &[u8]) -> (String, String) {
    let config = Bytes::from(format!("{{\"image\":\"{}\"}}", image));
    let layer = Bytes::copy_from_slice(layer);
    let config_digest = sha256_digest(&config);
    let layer_digest = sha256_digest(&layer);
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": config_digest, "size": config.len()},
        "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": layer_digest, "size": layer.len()}]
    });

    let reference = cachedimage::ImageReference::parse(image).unwrap();
    cache
        .put(
            &CacheKey::Manifest(reference),
            Bytes::from(serde_json::to_vec(&manifest).unwrap()),
        )
        .await
        .unwrap();
    cache.put(&CacheKey::Blob(config_digest.clone()), config).await.unwrap();
    cache.put(&CacheKey::Blob(layer_digest.clone()), layer).await.unwrap();
    (config_digest, layer_digest)
}
