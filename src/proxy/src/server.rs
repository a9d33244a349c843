use crate::cache::CacheStorage;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::prepull::{pre_pull, PrePullRequest};
use crate::registry::{get_blob, get_manifest, head_blob, head_manifest};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cachedimage::UsageTracker;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const V2_PREFIX: &str = "/v2/";
const MANIFESTS_SEGMENT: &str = "/manifests/";
const BLOBS_SEGMENT: &str = "/blobs/";

enum V2Route {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
}

/// Split a `/v2/<name>/(manifests|blobs)/<ref>` path.
///
/// Repository names contain slashes, so this cannot be expressed as an
/// axum route pattern.
fn parse_v2_path(uri: &Uri) -> Option<V2Route> {
    let mut path = uri.path().to_string();

    // Some runtimes add /v2/ to an image reference that already had it
    // (e.g. /v2/v2/quay.io/cilium/cilium/manifests/v1.17.7)
    while path.starts_with("/v2/v2/") {
        tracing::warn!(original_path = %path, "Stripping duplicated /v2/ prefix");
        path = path.replacen("/v2/v2/", "/v2/", 1);
    }

    let rest = path.strip_prefix(V2_PREFIX)?;
    if let Some(idx) = rest.rfind(MANIFESTS_SEGMENT) {
        let name = &rest[..idx];
        let reference = &rest[idx + MANIFESTS_SEGMENT.len()..];
        if name.is_empty() || reference.is_empty() {
            return None;
        }
        return Some(V2Route::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        });
    }
    if let Some(idx) = rest.rfind(BLOBS_SEGMENT) {
        let name = &rest[..idx];
        let digest = &rest[idx + BLOBS_SEGMENT.len()..];
        if name.is_empty() || digest.is_empty() {
            return None;
        }
        return Some(V2Route::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        });
    }
    None
}

fn unsupported_path(uri: &Uri) -> Response {
    tracing::debug!(path = %uri.path(), "Unsupported registry API path");
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "errors": [{"code": "UNSUPPORTED", "message": "unsupported registry API path"}]
        })),
    )
        .into_response()
}

async fn get_v2(State(state): State<AppState>, uri: Uri) -> Response {
    match parse_v2_path(&uri) {
        Some(V2Route::Manifest { name, reference }) => {
            get_manifest(State(state), Path((name, reference))).await
        }
        Some(V2Route::Blob { name, digest }) => get_blob(State(state), Path((name, digest))).await,
        None => unsupported_path(&uri),
    }
}

async fn head_v2(State(state): State<AppState>, uri: Uri) -> Response {
    match parse_v2_path(&uri) {
        Some(V2Route::Manifest { name, reference }) => {
            head_manifest(State(state), Path((name, reference))).await
        }
        Some(V2Route::Blob { name, digest }) => head_blob(State(state), Path((name, digest))).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn api_version() -> impl IntoResponse {
    tracing::debug!("GET /v2/ - API version request");
    (
        StatusCode::OK,
        [
            (
                HeaderName::from_static("docker-distribution-api-version"),
                "registry/2.0",
            ),
            (header::CONTENT_TYPE, "application/json"),
        ],
        "{}",
    )
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// POST /api/v1/pre-pull
async fn pre_pull_handler(
    State(state): State<AppState>,
    Json(req): Json<PrePullRequest>,
) -> impl IntoResponse {
    Json(pre_pull(&state, req.images).await)
}

#[derive(Serialize)]
struct CacheStats {
    total_blobs: usize,
    total_size_bytes: u64,
}

/// GET /api/v1/cache/stats
async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let blobs_dir = state.cache.base_dir().join("blobs").join("sha256");

    let mut total_blobs = 0usize;
    let mut total_size_bytes = 0u64;
    if let Ok(mut entries) = tokio::fs::read_dir(&blobs_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() && entry.path().extension().is_none() {
                    total_blobs += 1;
                    total_size_bytes += metadata.len();
                }
            }
        }
    }

    Json(CacheStats {
        total_blobs,
        total_size_bytes,
    })
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/*path", get(get_v2).head(head_v2))
        .route("/api/v1/pre-pull", post(pre_pull_handler))
        .route("/api/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .with_state(app_state)
}

/// A bound, not yet serving, proxy
pub struct ProxyServer {
    listener: TcpListener,
    state: AppState,
}

impl ProxyServer {
    /// Open the cache and bind the listener. Bind failures surface here,
    /// before anything is spawned.
    pub async fn bind(config: ProxyConfig, tracker: Option<Arc<UsageTracker>>) -> Result<Self> {
        let cache_dir = PathBuf::from(&config.cache.directory);
        tracing::info!(directory = %cache_dir.display(), "Initializing cache storage");
        let cache = Arc::new(CacheStorage::new(cache_dir)?);
        Self::bind_with_cache(config, cache, tracker).await
    }

    /// Same as `bind`, sharing an already opened cache
    pub async fn bind_with_cache(
        config: ProxyConfig,
        cache: Arc<CacheStorage>,
        tracker: Option<Arc<UsageTracker>>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.server.bind_address, config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
        tracing::info!(
            address = %addr,
            registries = config.upstream.registries.len(),
            revalidate_tags = config.upstream.revalidate_tags,
            "Registry proxy listener bound"
        );

        Ok(Self {
            listener,
            state: AppState::new(cache, config, tracker),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let app = build_router(self.state);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("Registry proxy stopped");
        Ok(())
    }
}
