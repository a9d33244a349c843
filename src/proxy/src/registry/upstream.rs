use crate::config::{RegistryConfig, DEFAULT_MANIFEST_ACCEPT_HEADER, DEFAULT_MANIFEST_MEDIA_TYPE};
use crate::error::{ProxyError, Result};
use crate::registry::auth::{fetch_token, parse_challenge, Challenge, TokenCache, TokenKey};
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// A manifest as returned by the upstream registry
#[derive(Debug, Clone)]
pub struct UpstreamManifest {
    pub body: Bytes,
    pub content_type: String,
}

enum Credentials {
    Bearer(String),
    Basic,
}

/// HTTP client for one upstream registry
pub struct UpstreamClient {
    registry: String,
    config: RegistryConfig,
    client: Client,
    tokens: Arc<TokenCache>,
}

impl UpstreamClient {
    pub fn new(registry: &str, config: RegistryConfig, tokens: Arc<TokenCache>) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            // Connection pool configuration
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            // Idle gap between body chunks; blob bodies have no overall deadline
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ProxyError::Http)?;

        Ok(Self {
            registry: registry.to_string(),
            config,
            client,
            tokens,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn endpoint(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    /// Whole-request deadline for small responses (manifests, HEAD, tokens)
    fn deadline(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    /// GET a manifest by tag or digest
    pub async fn get_manifest(&self, repository: &str, reference: &str) -> Result<UpstreamManifest> {
        let path = format!("/v2/{}/manifests/{}", repository, reference);
        let response = self
            .send(
                Method::GET,
                &path,
                repository,
                Some(DEFAULT_MANIFEST_ACCEPT_HEADER),
                self.deadline(),
            )
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| DEFAULT_MANIFEST_MEDIA_TYPE.to_string());

        let body = response.bytes().await.map_err(|e| {
            ProxyError::UpstreamUnavailable(format!(
                "reading manifest {}/{}:{} failed: {}",
                self.registry, repository, reference, e
            ))
        })?;

        Ok(UpstreamManifest { body, content_type })
    }

    /// GET a blob; the response body is left unread for streaming
    pub async fn get_blob(&self, repository: &str, digest: &str) -> Result<Response> {
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        self.send(Method::GET, &path, repository, None, None).await
    }

    /// HEAD a blob, returning its size when upstream reports one
    pub async fn head_blob(&self, repository: &str, digest: &str) -> Result<Option<u64>> {
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        let response = self
            .send(Method::HEAD, &path, repository, None, self.deadline())
            .await?;
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }

    fn request(
        &self,
        method: &Method,
        path: &str,
        accept: Option<&str>,
        deadline: Option<Duration>,
    ) -> RequestBuilder {
        let url = format!("{}{}", self.endpoint(), path);
        let mut request = self.client.request(method.clone(), url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(deadline) = deadline {
            request = request.timeout(deadline);
        }
        request
    }

    /// Send a request, answering one authentication challenge.
    ///
    /// The first attempt is always unauthenticated. A `401` with a Bearer
    /// challenge is retried once with a (cached) token, a Basic challenge
    /// once with the configured credentials. A second `401` is final.
    /// `deadline` bounds the whole exchange, body included; without one only
    /// the client's connect and idle-read timeouts apply.
    async fn send(
        &self,
        method: Method,
        path: &str,
        repository: &str,
        accept: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<Response> {
        let response = self
            .execute(self.request(&method, path, accept, deadline), path)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.check_status(response, path);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);

        let (credentials, token_key) = match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let key = TokenKey {
                    realm,
                    service,
                    // Without a scope the token would not cover the repository
                    scope: scope.or_else(|| Some(format!("repository:{}:pull", repository))),
                };
                let token = self
                    .tokens
                    .get_or_fetch(&key, || {
                        fetch_token(&self.client, &key, self.config.auth.as_ref(), self.deadline())
                    })
                    .await?;
                (Credentials::Bearer(token), Some(key))
            }
            Some(Challenge::Basic { .. }) if self.config.auth.is_some() => (Credentials::Basic, None),
            _ => {
                return Err(ProxyError::AuthRequired(format!(
                    "{}{} requires authentication",
                    self.registry, path
                )))
            }
        };

        let mut retry = self.request(&method, path, accept, deadline);
        retry = match (&credentials, &self.config.auth) {
            (Credentials::Bearer(token), _) => retry.header(AUTHORIZATION, format!("Bearer {}", token)),
            (Credentials::Basic, Some(auth)) => retry.basic_auth(&auth.username, Some(&auth.password)),
            (Credentials::Basic, None) => retry,
        };

        let response = self.execute(retry, path).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(key) = &token_key {
                self.tokens.invalidate(key).await;
            }
            tracing::warn!(
                registry = %self.registry,
                path = %path,
                "Upstream rejected credentials after authenticated retry"
            );
            return Err(ProxyError::AuthRequired(format!(
                "{}{} rejected the credentials",
                self.registry, path
            )));
        }
        self.check_status(response, path)
    }

    async fn execute(&self, request: RequestBuilder, path: &str) -> Result<Response> {
        request.send().await.map_err(|e| {
            tracing::warn!(
                registry = %self.registry,
                path = %path,
                error = %e,
                "Upstream request failed"
            );
            ProxyError::UpstreamUnavailable(format!("{}{}: {}", self.registry, path, e))
        })
    }

    fn check_status(&self, response: Response, path: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = format!("{}{} returned {}", self.registry, path, status);
        Err(match status {
            StatusCode::NOT_FOUND => ProxyError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProxyError::AuthRequired(message),
            StatusCode::TOO_MANY_REQUESTS => ProxyError::UpstreamUnavailable(message),
            s if s.is_server_error() => ProxyError::UpstreamUnavailable(message),
            _ => ProxyError::Registry(message),
        })
    }
}
