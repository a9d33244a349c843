use crate::cache::CacheStorage;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::registry::auth::TokenCache;
use crate::registry::upstream::UpstreamClient;
use cachedimage::{ImageReference, UsageTracker};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared state of every proxy request handler
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheStorage>,
    pub config: Arc<ProxyConfig>,
    pub registry_clients: Arc<RwLock<HashMap<String, Arc<UpstreamClient>>>>,
    pub token_cache: Arc<TokenCache>,
    /// Lifecycle notifications; absent when running without a cluster
    pub tracker: Option<Arc<UsageTracker>>,
    /// Addresses the proxy is reached on, stripped from image references
    pub proxy_hosts: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        cache: Arc<CacheStorage>,
        config: ProxyConfig,
        tracker: Option<Arc<UsageTracker>>,
    ) -> Self {
        let proxy_hosts = config.server.proxy_hosts();
        Self {
            cache,
            config: Arc::new(config),
            registry_clients: Arc::new(RwLock::new(HashMap::new())),
            token_cache: Arc::new(TokenCache::new()),
            tracker,
            proxy_hosts: Arc::new(proxy_hosts),
        }
    }

    /// Canonical image for a `/v2/<name>/...` request
    pub fn image_reference(&self, name: &str, reference: &str) -> Result<ImageReference> {
        let image = ImageReference::from_api_path(name, reference, &self.proxy_hosts)?;
        if self.proxy_hosts.iter().any(|host| host == &image.registry) {
            return Err(ProxyError::InvalidReference(format!(
                "{} points back at this proxy",
                image
            )));
        }
        Ok(image)
    }

    /// Get upstream client for a registry, creating it on first use
    pub fn get_upstream_client(&self, registry: &str) -> Result<Arc<UpstreamClient>> {
        {
            let clients = self
                .registry_clients
                .read()
                .map_err(|_| ProxyError::Cache("registry client map poisoned".to_string()))?;
            if let Some(client) = clients.get(registry) {
                return Ok(client.clone());
            }
        }

        let registry_config = self.config.registry(registry);
        let mut clients = self
            .registry_clients
            .write()
            .map_err(|_| ProxyError::Cache("registry client map poisoned".to_string()))?;
        // Another request may have created it while we waited for the write lock
        if let Some(client) = clients.get(registry) {
            return Ok(client.clone());
        }

        tracing::info!(
            registry = %registry,
            endpoint = %registry_config.endpoint,
            "Creating upstream client"
        );
        let client = Arc::new(UpstreamClient::new(
            registry,
            registry_config,
            self.token_cache.clone(),
        )?);
        clients.insert(registry.to_string(), client.clone());
        Ok(client)
    }

    /// Record a successful resolution in the background
    pub fn notify_cached(&self, image: &ImageReference, digest: &str) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        let image = image.clone();
        let digest = digest.to_string();
        tokio::spawn(async move {
            if let Err(e) = tracker.mark_cached(&image, &digest).await {
                tracing::warn!(image = %image, error = %e, "Failed to record cached image");
            }
        });
    }

    /// Record a failed resolution in the background
    pub fn notify_failure(&self, image: &ImageReference, error: &ProxyError) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        let image = image.clone();
        let reason = error.to_string();
        tokio::spawn(async move {
            if let Err(e) = tracker.record_failure(&image, &reason).await {
                tracing::warn!(image = %image, error = %e, "Failed to record image failure");
            }
        });
    }
}
