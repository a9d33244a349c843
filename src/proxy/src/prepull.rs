use crate::cache::ManifestDocument;
use crate::error::{ProxyError, Result};
use crate::registry::{fill_blob, resolve_manifest, resolve_untracked};
use crate::state::AppState;
use cachedimage::{ImageReference, Reference};
use futures::future;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct PrePullRequest {
    pub images: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PrePullResponse {
    pub status: String,
    pub results: Vec<PrePullResult>,
}

#[derive(Debug, Serialize)]
pub struct PrePullResult {
    pub image: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Warm the cache for every image, `pre_pull.image_concurrency` at a time
pub async fn pre_pull(state: &AppState, images: Vec<String>) -> PrePullResponse {
    let semaphore = Arc::new(Semaphore::new(state.config.pre_pull.image_concurrency));
    let started = std::time::Instant::now();

    let pulls = images.into_iter().map(|image| {
        let state = state.clone();
        let semaphore = semaphore.clone();
        async move {
            let outcome = match semaphore.acquire().await {
                Ok(_permit) => pull_image(&state, &image).await,
                Err(e) => Err(ProxyError::Cache(format!("pre-pull aborted: {}", e))),
            };
            match outcome {
                Ok(size) => {
                    info!(image = %image, size = size, "[prepull] Completed");
                    PrePullResult {
                        image,
                        status: "success".to_string(),
                        size: Some(size),
                    }
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "[prepull] Failed");
                    PrePullResult {
                        image,
                        status: format!("error: {}", e),
                        size: None,
                    }
                }
            }
        }
    });

    let results = future::join_all(pulls).await;
    info!(
        images = results.len(),
        failed = results.iter().filter(|r| r.size.is_none()).count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "[prepull] Finished"
    );

    PrePullResponse {
        status: "ok".to_string(),
        results,
    }
}

/// Pull one image into the cache: its manifest, the platform manifest of an
/// index, and the config and layer blobs. Returns the blob bytes cached.
pub async fn pull_image(state: &AppState, image_ref: &str) -> Result<u64> {
    let image = ImageReference::parse_with_proxy_hosts(image_ref, &state.proxy_hosts)?;
    debug!(image = %image, "[prepull] Parsed image");

    let (manifest, _) = resolve_manifest(state, &image).await?;
    let mut doc = ManifestDocument::parse(&manifest.body)?;

    if doc.is_index() {
        let platform = &state.config.pre_pull.platform;
        let child = doc.child_for_platform(platform).ok_or_else(|| {
            ProxyError::NotFound(format!("{} has no manifest for platform {}", image, platform))
        })?;
        debug!(image = %image, platform = %platform, digest = %child.digest, "[prepull] Selected platform manifest");

        let child_image = ImageReference {
            reference: Reference::Digest(child.digest.clone()),
            ..image.clone()
        };
        let (child_manifest, _) = resolve_untracked(state, &child_image).await?;
        doc = ManifestDocument::parse(&child_manifest.body)?;
    }

    let digests: Vec<String> = doc.blob_digests().into_iter().map(String::from).collect();
    debug!(image = %image, layers = digests.len(), "[prepull] Pulling blobs");

    let semaphore = Arc::new(Semaphore::new(state.config.pre_pull.layer_concurrency));
    let fills = digests.iter().map(|digest| {
        let semaphore = semaphore.clone();
        let image = &image;
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| ProxyError::Cache(format!("pre-pull aborted: {}", e)))?;
            fill_blob(state, image, digest).await
        }
    });

    let mut total_size = 0u64;
    let mut failed = Vec::new();
    for (digest, result) in digests.iter().zip(future::join_all(fills).await) {
        match result {
            Ok(size) => total_size += size,
            Err(e) => {
                warn!(image = %image, digest = %digest, error = %e, "[prepull] Failed to pull blob");
                failed.push(e);
            }
        }
    }

    if let Some(first) = failed.first() {
        return Err(ProxyError::Registry(format!(
            "failed to pull {}/{} blobs for {}: {}",
            failed.len(),
            digests.len(),
            image,
            first
        )));
    }
    Ok(total_size)
}
