use crate::cache::{digest_hex, BlobFill, BlobSource};
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
use futures::StreamExt;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Start filling the cache with one blob, sharing the upstream fetch with
/// every concurrent request for the same digest.
///
/// Returns as soon as upstream has answered; the body keeps streaming to
/// disk in the background and can be followed while it is written.
pub async fn start_blob_fill(state: &AppState, image: &ImageReference, digest: &str) -> Result<BlobSource> {
    let upstream = state.get_upstream_client(&image.registry)?;
    let cache = state.cache.clone();
    let repository = image.repository.clone();
    let target = digest.to_string();

    state
        .cache
        .blob_fills()
        .run(digest, move || async move {
            // Checked before the cache: a fill unregisters only after its rename
            if let Some(fill) = cache.blob_in_progress(&target) {
                return Ok(BlobSource::Filling(fill));
            }
            if let Some(size) = cache.blob_size(&target).await? {
                return Ok(BlobSource::Cached(size));
            }

            let response = upstream.get_blob(&repository, &target).await?;
            let content_length = response.content_length();
            let body = response.bytes_stream().map(|chunk| {
                chunk.map_err(|e| ProxyError::UpstreamUnavailable(format!("reading blob body failed: {}", e)))
            });
            let fill = cache.start_blob_fill(&target, content_length, body).await?;
            tracing::info!(
                registry = %upstream.registry(),
                repository = %repository,
                digest = %target,
                size = ?content_length,
                "Streaming blob from upstream into cache"
            );
            Ok(BlobSource::Filling(fill))
        })
        .await
}

/// Fill the cache with one blob and wait until it is stored. Returns the
/// blob size.
pub async fn fill_blob(state: &AppState, image: &ImageReference, digest: &str) -> Result<u64> {
    match start_blob_fill(state, image, digest).await? {
        BlobSource::Cached(size) => Ok(size),
        BlobSource::Filling(fill) => fill.finished().await,
    }
}

/// Serve a blob while it is being written to the cache
async fn follow_fill(fill: &BlobFill) -> Result<Option<Response>> {
    let Some(stream) = fill.follow().await? else {
        return Ok(None);
    };
    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (DOCKER_CONTENT_DIGEST, fill.digest().to_string()),
            (X_CACHE, "MISS".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response();
    if let Some(size) = fill.content_length() {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, size.into());
    }
    Ok(Some(response))
}

async fn serve_cached_blob(state: &AppState, digest: &str, cache_status: &'static str) -> Result<Option<Response>> {
    let Some((file, size)) = state.cache.open_blob(digest).await? else {
        return Ok(None);
    };
    let reader = BufReader::with_capacity(64 * 1024, file);
    let body = Body::from_stream(ReaderStream::new(reader));
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH, size.to_string()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
        (X_CACHE, cache_status.to_string()),
    ];
    Ok(Some((StatusCode::OK, headers, body).into_response()))
}

fn blob_image(state: &AppState, name: &str, digest: &str) -> Result<ImageReference> {
    digest_hex(digest)?;
    state.image_reference(name, digest)
}

/// GET /v2/{name}/blobs/{digest}
///
/// 1. Serve from cache when present
/// 2. Otherwise start (or join) the fill and stream the blob to the client
///    while it is written to disk
/// 3. A fill that already finished is served from the stored file
pub async fn get_blob(
    State(state): State<AppState>,
    Path((name, digest)): Path<(String, String)>,
) -> Response {
    tracing::debug!(name = %name, digest = %digest, "GET blob request");

    let image = match blob_image(&state, &name, &digest) {
        Ok(image) => image,
        Err(e) => return error_response(&e, "BLOB_UNKNOWN"),
    };

    match serve_cached_blob(&state, &digest, "HIT").await {
        Ok(Some(response)) => {
            tracing::info!(digest = %digest, "Blob cache HIT");
            return response;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(digest = %digest, error = %e, "Cache check failed, fetching from upstream");
        }
    }

    tracing::info!(digest = %digest, image = %image.repository_path(), "Blob cache MISS - fetching from upstream");

    let fill_error = match start_blob_fill(&state, &image, &digest).await {
        Ok(BlobSource::Cached(_)) => None,
        Ok(BlobSource::Filling(fill)) => match follow_fill(&fill).await {
            Ok(Some(response)) => return response,
            // Finished before it could be followed
            Ok(None) => fill.finished().await.err(),
            Err(e) => Some(e),
        },
        Err(e) => Some(e),
    };

    // Served from disk either way; a failed fill may still have been
    // completed by another request
    match serve_cached_blob(&state, &digest, "MISS").await {
        Ok(Some(response)) => {
            if let Some(e) = &fill_error {
                tracing::warn!(digest = %digest, error = %e, "Upstream failed, serving cached blob");
            }
            response
        }
        Ok(None) => {
            let e = fill_error.unwrap_or_else(|| {
                ProxyError::Cache(format!("blob {} vanished after fill", digest))
            });
            tracing::warn!(digest = %digest, error = %e, "Blob request failed");
            error_response(&e, "BLOB_UNKNOWN")
        }
        Err(e) => error_response(&fill_error.unwrap_or(e), "BLOB_UNKNOWN"),
    }
}

/// HEAD /v2/{name}/blobs/{digest}
///
/// Answered from the cache when present, otherwise asked upstream without
/// filling the cache.
pub async fn head_blob(
    State(state): State<AppState>,
    Path((name, digest)): Path<(String, String)>,
) -> Response {
    tracing::debug!(name = %name, digest = %digest, "HEAD blob request");

    let image = match blob_image(&state, &name, &digest) {
        Ok(image) => image,
        Err(e) => return head_error_response(&e),
    };

    let (size, cache_status) = match state.cache.blob_size(&digest).await {
        Ok(Some(size)) => (Some(size), "HIT"),
        _ => {
            let upstream = match state.get_upstream_client(&image.registry) {
                Ok(upstream) => upstream,
                Err(e) => return head_error_response(&e),
            };
            match upstream.head_blob(&image.repository, &digest).await {
                Ok(size) => (size, "MISS"),
                Err(e) => {
                    tracing::debug!(digest = %digest, error = %e, "Upstream HEAD blob failed");
                    return head_error_response(&e);
                }
            }
        }
    };

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.clone()),
            (X_CACHE, cache_status.to_string()),
        ],
    )
        .into_response();
    if let Some(size) = size {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, size.into());
    }
    response
}
