//! Mock upstream registry shared by the integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use proxy::cache::sha256_digest;
use proxy::config::{ProxyConfig, RegistryConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const TOKEN: &str = "mock-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Anonymous,
    Bearer,
    /// Challenges every request, even with a valid token
    RejectAll,
}

#[derive(Default)]
pub struct Counters {
    pub manifest: AtomicUsize,
    pub blob: AtomicUsize,
    pub token: AtomicUsize,
}

impl Counters {
    pub fn manifests(&self) -> usize {
        self.manifest.load(Ordering::SeqCst)
    }
    pub fn blobs(&self) -> usize {
        self.blob.load(Ordering::SeqCst)
    }
    pub fn tokens(&self) -> usize {
        self.token.load(Ordering::SeqCst)
    }
}

/// One image: a manifest with a config blob and one layer
pub struct TestImage {
    pub repository: String,
    pub tag: String,
    pub manifest: Bytes,
    pub manifest_digest: String,
    pub blobs: Vec<(String, Bytes)>,
}

impl TestImage {
    pub fn new(repository: &str, tag: &str, layer: &[u8]) -> Self {
        let config = Bytes::from(format!(
            "{{\"architecture\":\"amd64\",\"repo\":\"{}\",\"tag\":\"{}\"}}",
            repository, tag
        ));
        let layer = Bytes::copy_from_slice(layer);
        let config_digest = sha256_digest(&config);
        let layer_digest = sha256_digest(&layer);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_TYPE,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": config_digest, "size": config.len()},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": layer_digest, "size": layer.len()}]
        });
        let manifest = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            manifest_digest: sha256_digest(&manifest),
            manifest,
            blobs: vec![(config_digest, config), (layer_digest, layer)],
        }
    }

    pub fn layer_digest(&self) -> &str {
        &self.blobs[1].0
    }

    pub fn layer(&self) -> &Bytes {
        &self.blobs[1].1
    }
}

#[derive(Clone)]
struct MockState {
    manifests: Arc<HashMap<String, Bytes>>,
    blobs: Arc<HashMap<String, Bytes>>,
    counters: Arc<Counters>,
    auth: AuthMode,
    realm: String,
    pace: Pace,
}

/// How slowly the mock answers
#[derive(Debug, Clone, Copy, Default)]
pub struct Pace {
    /// Before answering any manifest or blob request
    pub delay: Duration,
    /// Between the 64 KiB chunks of a blob body
    pub chunk_interval: Duration,
}

const MOCK_CHUNK_SIZE: usize = 64 * 1024;

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub counters: Arc<Counters>,
}

impl MockRegistry {
    pub async fn start(images: &[&TestImage], auth: AuthMode) -> Self {
        Self::start_paced(images, auth, Pace::default()).await
    }

    pub async fn start_with_delay(images: &[&TestImage], auth: AuthMode, delay: Duration) -> Self {
        let pace = Pace {
            delay,
            ..Pace::default()
        };
        Self::start_paced(images, auth, pace).await
    }

    pub async fn start_paced(images: &[&TestImage], auth: AuthMode, pace: Pace) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut manifests = HashMap::new();
        let mut blobs = HashMap::new();
        for image in images {
            manifests.insert(format!("{}:{}", image.repository, image.tag), image.manifest.clone());
            manifests.insert(
                format!("{}:{}", image.repository, image.manifest_digest),
                image.manifest.clone(),
            );
            for (digest, data) in &image.blobs {
                blobs.insert(digest.clone(), data.clone());
            }
        }

        let counters = Arc::new(Counters::default());
        let state = MockState {
            manifests: Arc::new(manifests),
            blobs: Arc::new(blobs),
            counters: counters.clone(),
            auth,
            realm: format!("http://{}/token", addr),
            pace,
        };

        let app = Router::new()
            .route("/token", get(token))
            .route("/v2/*path", get(registry))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, counters }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn token(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.counters.token.fetch_add(1, Ordering::SeqCst);
    if params.get("service").map(String::as_str) != Some("registry") || !params.contains_key("scope") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    // Some registries send expires_in as a string
    Json(serde_json::json!({"token": TOKEN, "expires_in": "3600"})).into_response()
}

async fn registry(State(state): State<MockState>, uri: Uri, headers: HeaderMap) -> Response {
    let authorized = match state.auth {
        AuthMode::Anonymous => true,
        AuthMode::Bearer => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {}", TOKEN)),
        AuthMode::RejectAll => false,
    };
    if !authorized {
        let challenge = format!(
            r#"Bearer realm="{}",service="registry",scope="repo:pull""#,
            state.realm
        );
        return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, challenge)]).into_response();
    }

    let path = uri.path().trim_start_matches("/v2/");
    if let Some((repository, reference)) = path.rsplit_once("/manifests/") {
        state.counters.manifest.fetch_add(1, Ordering::SeqCst);
        if !state.pace.delay.is_zero() {
            tokio::time::sleep(state.pace.delay).await;
        }
        return match state.manifests.get(&format!("{}:{}", repository, reference)) {
            Some(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, MANIFEST_TYPE)],
                Body::from(body.clone()),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }
    if let Some((_, digest)) = path.rsplit_once("/blobs/") {
        state.counters.blob.fetch_add(1, Ordering::SeqCst);
        if !state.pace.delay.is_zero() {
            tokio::time::sleep(state.pace.delay).await;
        }
        return match state.blobs.get(digest) {
            Some(body) => (
                StatusCode::OK,
                [(header::CONTENT_LENGTH, body.len().to_string())],
                paced_body(body.clone(), state.pace.chunk_interval),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }
    StatusCode::NOT_FOUND.into_response()
}

fn paced_body(body: Bytes, interval: Duration) -> Body {
    if interval.is_zero() {
        return Body::from(body);
    }
    let chunks = futures::stream::unfold(body, move |mut rest| async move {
        if rest.is_empty() {
            return None;
        }
        tokio::time::sleep(interval).await;
        let chunk = rest.split_to(rest.len().min(MOCK_CHUNK_SIZE));
        Some((Ok::<_, std::io::Error>(chunk), rest))
    });
    Body::from_stream(chunks)
}

/// An address nothing listens on
pub async fn closed_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn registry_config(endpoint: String) -> RegistryConfig {
    RegistryConfig {
        endpoint,
        timeout_secs: 5,
        auth: None,
        insecure: false,
    }
}

/// Proxy configuration on an ephemeral local port routing `registry` to `endpoint`
pub fn proxy_config(cache_dir: &std::path::Path, registry: &str, endpoint: String) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.cache.directory = cache_dir.display().to_string();
    config
        .upstream
        .registries
        .insert(registry.to_string(), registry_config(endpoint));
    config
}
