use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// Constants for hardcoded values
/// Default Docker registry name
pub const DEFAULT_REGISTRY_NAME: &str = cachedimage::DEFAULT_REGISTRY_NAME;

/// Default Docker registry URL
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Manifest Accept header sent upstream.
/// Manifest lists / indexes come first so multi-arch tags resolve to the index.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Media type used when upstream does not send one
pub const DEFAULT_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Default token expiry in seconds when the token endpoint omits expires_in
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Safety margin to subtract from token expiry (30 seconds)
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Default proxy port, the one pod images are rewritten to
pub const DEFAULT_PROXY_PORT: u16 = 8082;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pre_pull: PrePullConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Addresses pods reach the proxy on. Image references starting with one
    /// of these are proxy-rewritten and never resolved against ourselves.
    #[serde(default = "default_advertised_hosts")]
    pub advertised_hosts: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            advertised_hosts: default_advertised_hosts(),
        }
    }
}

impl ServerConfig {
    /// Advertised hosts plus the loopback names for the configured port
    pub fn proxy_hosts(&self) -> Vec<String> {
        let mut hosts = self.advertised_hosts.clone();
        for host in [
            format!("localhost:{}", self.port),
            format!("127.0.0.1:{}", self.port),
        ] {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_advertised_hosts() -> Vec<String> {
    vec![
        format!("localhost:{}", DEFAULT_PROXY_PORT),
        format!("127.0.0.1:{}", DEFAULT_PROXY_PORT),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
        }
    }
}

fn default_cache_directory() -> String {
    "/var/cache/image-keeper".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,
    /// Look tag manifests up upstream first, falling back to the cache on failure
    #[serde(default)]
    pub revalidate_tags: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry API (scheme + host, no /v2/)
    pub endpoint: String,
    /// Deadline for manifest and token requests; blob bodies may stream for
    /// longer as long as no gap between chunks exceeds it
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
    #[serde(default)]
    pub insecure: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl RegistryConfig {
    /// Configuration used for registries that are not configured explicitly
    pub fn for_host(registry: &str) -> Self {
        let endpoint = if registry == DEFAULT_REGISTRY_NAME {
            DEFAULT_REGISTRY_URL.to_string()
        } else {
            format!("https://{}", registry)
        };
        Self {
            endpoint,
            timeout_secs: default_timeout_secs(),
            auth: None,
            insecure: false,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(format!(
                "registry endpoint {} must start with http:// or https://",
                self.endpoint
            ));
        }
        if self.timeout_secs == 0 {
            return Err("registry timeout_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrePullConfig {
    #[serde(default = "default_image_concurrency")]
    pub image_concurrency: usize,
    #[serde(default = "default_layer_concurrency")]
    pub layer_concurrency: usize,
    /// Platform selected from image indexes, as os/architecture
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for PrePullConfig {
    fn default() -> Self {
        Self {
            image_concurrency: default_image_concurrency(),
            layer_concurrency: default_layer_concurrency(),
            platform: default_platform(),
        }
    }
}

fn default_image_concurrency() -> usize {
    4
}

fn default_layer_concurrency() -> usize {
    4
}

fn default_platform() -> String {
    "linux/amd64".to_string()
}

impl ProxyConfig {
    /// Load a proxy-only configuration file (YAML)
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ProxyConfig = serde_yaml::from_str(&raw).map_err(|e| {
            ProxyError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.directory.trim().is_empty() {
            return Err(ProxyError::Config("cache.directory must not be empty".to_string()));
        }
        if self.pre_pull.image_concurrency == 0 || self.pre_pull.layer_concurrency == 0 {
            return Err(ProxyError::Config(
                "pre_pull concurrency must be greater than zero".to_string(),
            ));
        }
        for (name, registry) in &self.upstream.registries {
            registry
                .validate()
                .map_err(|e| ProxyError::Config(format!("registry {}: {}", name, e)))?;
        }
        Ok(())
    }

    /// Configuration for `registry`, explicit or derived from its host name
    pub fn registry(&self, registry: &str) -> RegistryConfig {
        self.upstream
            .registries
            .get(registry)
            .cloned()
            .unwrap_or_else(|| RegistryConfig::for_host(registry))
    }
}
