use crate::cache::CachedManifest;
use crate::error::{ProxyError, Result};
use crate::registry::{error_response, head_error_response};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use cachedimage::ImageReference;

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Where a served manifest came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    Cache,
    Upstream,
    /// Upstream failed, cached copy served instead
    Stale,
}

impl ManifestSource {
    fn header_value(self) -> &'static str {
        match self {
            ManifestSource::Cache => "HIT",
            ManifestSource::Upstream => "MISS",
            ManifestSource::Stale => "STALE",
        }
    }
}

/// Resolve the manifest of `image` and report the outcome to the lifecycle
/// tracker in the background.
pub async fn resolve_manifest(
    state: &AppState,
    image: &ImageReference,
) -> Result<(CachedManifest, ManifestSource)> {
    match resolve_untracked(state, image).await {
        Ok((manifest, source)) => {
            state.notify_cached(image, &manifest.metadata.digest);
            Ok((manifest, source))
        }
        Err(e) => {
            if e.is_upstream_failure() || matches!(e, ProxyError::NotFound(_)) {
                state.notify_failure(image, &e);
            }
            Err(e)
        }
    }
}

/// Resolve the manifest of `image` through the cache.
///
/// Cache first; tag lookups go upstream first instead when tag revalidation
/// is enabled. Misses are filled through a single upstream fetch shared by
/// all concurrent requests. When upstream fails and a cached copy exists,
/// the cached copy wins.
pub async fn resolve_untracked(
    state: &AppState,
    image: &ImageReference,
) -> Result<(CachedManifest, ManifestSource)> {
    let revalidate = state.config.upstream.revalidate_tags && !image.is_digest();

    if !revalidate {
        if let Some(manifest) = state.cache.lookup_manifest(image).await? {
            tracing::info!(
                image = %image,
                digest = %manifest.metadata.digest,
                "Manifest cache HIT"
            );
            return Ok((manifest, ManifestSource::Cache));
        }
        tracing::info!(image = %image, "Manifest cache MISS - fetching from upstream");
    }

    match fill_manifest(state, image).await {
        Ok(manifest) => Ok((manifest, ManifestSource::Upstream)),
        Err(e) => {
            if e.is_upstream_failure() {
                if let Some(manifest) = state.cache.lookup_manifest(image).await? {
                    tracing::warn!(
                        image = %image,
                        error = %e,
                        "Upstream failed, serving cached manifest"
                    );
                    return Ok((manifest, ManifestSource::Stale));
                }
            }
            tracing::warn!(image = %image, error = %e, "Manifest resolution failed");
            Err(e)
        }
    }
}

async fn fill_manifest(state: &AppState, image: &ImageReference) -> Result<CachedManifest> {
    let upstream = state.get_upstream_client(&image.registry)?;
    let cache = state.cache.clone();
    let target = image.clone();

    state
        .cache
        .manifest_fills()
        .run(&image.to_string(), move || async move {
            let fetched = upstream
                .get_manifest(&target.repository, &target.reference.to_string())
                .await?;
            let manifest = cache
                .write_manifest(&target, &fetched.content_type, fetched.body)
                .await?;
            tracing::info!(
                image = %target,
                digest = %manifest.metadata.digest,
                content_type = %manifest.metadata.content_type,
                size = manifest.metadata.size,
                "Cached manifest from upstream"
            );
            Ok(manifest)
        })
        .await
}

fn manifest_response(manifest: CachedManifest, source: ManifestSource, with_body: bool) -> Response {
    let headers = [
        (header::CONTENT_TYPE, manifest.metadata.content_type),
        (DOCKER_CONTENT_DIGEST, manifest.metadata.digest),
        (header::CONTENT_LENGTH, manifest.body.len().to_string()),
        (X_CACHE, source.header_value().to_string()),
    ];
    let body = if with_body {
        Body::from(manifest.body)
    } else {
        Body::empty()
    };
    (StatusCode::OK, headers, body).into_response()
}

/// GET /v2/{name}/manifests/{reference}
pub async fn get_manifest(
    State(state): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Response {
    tracing::debug!(name = %name, reference = %reference, "GET manifest request");

    let image = match state.image_reference(&name, &reference) {
        Ok(image) => image,
        Err(e) => return error_response(&e, "MANIFEST_UNKNOWN"),
    };
    match resolve_manifest(&state, &image).await {
        Ok((manifest, source)) => manifest_response(manifest, source, true),
        Err(e) => error_response(&e, "MANIFEST_UNKNOWN"),
    }
}

/// HEAD /v2/{name}/manifests/{reference}
pub async fn head_manifest(
    State(state): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Response {
    tracing::debug!(name = %name, reference = %reference, "HEAD manifest request");

    let image = match state.image_reference(&name, &reference) {
        Ok(image) => image,
        Err(e) => return head_error_response(&e),
    };
    match resolve_manifest(&state, &image).await {
        Ok((manifest, source)) => manifest_response(manifest, source, false),
        Err(e) => head_error_response(&e),
    }
}
