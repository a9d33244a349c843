//! Registry token authentication.
//!
//! Follows the distribution token flow: an unauthenticated request answered
//! with `401` and `WWW-Authenticate: Bearer realm=...,service=...,scope=...`
//! is retried once with a token obtained from the realm. Tokens are cached
//! per (realm, service, scope) until shortly before they expire.

use crate::config::{RegistryAuth, DEFAULT_TOKEN_EXPIRY_SECS, TOKEN_EXPIRY_SAFETY_MARGIN_SECS};
use crate::error::{ProxyError, Result};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

/// Parse a `WWW-Authenticate` header value.
///
/// Parameter values may be quoted and contain commas, e.g.
/// `scope="repository:samalba/my-app:pull,push"`. Scheme and parameter names
/// are case-insensitive.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = match header.find(char::is_whitespace) {
        Some(idx) => (&header[..idx], header[idx..].trim_start()),
        None => (header, ""),
    };
    let params = parse_params(rest);

    if scheme.eq_ignore_ascii_case("bearer") {
        Some(Challenge::Bearer {
            realm: params.get("realm")?.clone(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    } else if scheme.eq_ignore_ascii_case("basic") {
        Some(Challenge::Basic {
            realm: params.get("realm").cloned(),
        })
    } else {
        None
    }
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() && chars.peek().is_none() {
            break;
        }
        if chars.next() != Some('=') {
            // Bare token without a value, skip it
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    params
}

/// Token cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

type TokenSlot = Arc<Mutex<Option<CachedToken>>>;

/// Bearer tokens shared by every upstream client.
///
/// Each key has its own lock, held across the token fetch, so concurrent
/// requests for the same (realm, service, scope) perform a single fetch.
#[derive(Default)]
pub struct TokenCache {
    slots: Mutex<HashMap<TokenKey, TokenSlot>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &TokenKey) -> TokenSlot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Cached token for `key`, or the result of `fetch` when absent or expired
    pub async fn get_or_fetch<F, Fut>(&self, key: &TokenKey, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration)>>,
    {
        let slot = self.slot(key).await;
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                tracing::debug!(realm = %key.realm, scope = ?key.scope, "Using cached registry token");
                return Ok(token.token.clone());
            }
        }

        let (token, lifetime) = fetch().await?;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token)
    }

    /// Forget a token the registry rejected
    pub async fn invalidate(&self, key: &TokenKey) {
        let slot = self.slots.lock().await.get(key).cloned();
        if let Some(slot) = slot {
            *slot.lock().await = None;
        }
    }
}

/// How long a token is reused, given the `expires_in` the registry reported
pub fn token_lifetime(expires_in: Option<u64>) -> Duration {
    let expires_in = expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
    let secs = if expires_in > 2 * TOKEN_EXPIRY_SAFETY_MARGIN_SECS {
        expires_in - TOKEN_EXPIRY_SAFETY_MARGIN_SECS
    } else {
        expires_in
    };
    Duration::from_secs(secs)
}

/// Request a token from the challenge realm.
///
/// Registries disagree on field names (`token` vs `access_token`) and on
/// whether `expires_in` is a number or a string; all are accepted.
pub async fn fetch_token(
    client: &Client,
    key: &TokenKey,
    credentials: Option<&RegistryAuth>,
    deadline: Option<Duration>,
) -> Result<(String, Duration)> {
    let mut request = client.get(&key.realm);
    if let Some(deadline) = deadline {
        request = request.timeout(deadline);
    }
    if let Some(service) = &key.service {
        request = request.query(&[("service", service)]);
    }
    if let Some(scope) = &key.scope {
        request = request.query(&[("scope", scope)]);
    }
    if let Some(auth) = credentials {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }

    tracing::debug!(realm = %key.realm, service = ?key.service, scope = ?key.scope, "Requesting registry token");

    let response = request.send().await.map_err(|e| {
        ProxyError::UpstreamUnavailable(format!("token request to {} failed: {}", key.realm, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let message = format!("token endpoint {} returned {}", key.realm, status);
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProxyError::AuthRequired(message),
            StatusCode::TOO_MANY_REQUESTS => ProxyError::UpstreamUnavailable(message),
            s if s.is_server_error() => ProxyError::UpstreamUnavailable(message),
            _ => ProxyError::Registry(message),
        });
    }

    let json: serde_json::Value = response.json().await.map_err(|e| {
        ProxyError::Registry(format!("invalid token response from {}: {}", key.realm, e))
    })?;

    let token = json
        .get("token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .or_else(|| json.get("access_token").and_then(|t| t.as_str()))
        .ok_or_else(|| {
            ProxyError::Registry(format!("token response from {} has no token", key.realm))
        })?;

    let expires_in = json.get("expires_in").and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    });

    Ok((token.to_string(), token_lifetime(expires_in)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_with_quoted_comma() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:samalba/my-app:pull,push""#;
        assert_eq!(
            parse_challenge(header),
            Some(Challenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
                scope: Some("repository:samalba/my-app:pull,push".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_case_insensitive_and_spaces() {
        let header = r#"bearer Realm="https://auth/token", Service=registry"#;
        assert_eq!(
            parse_challenge(header),
            Some(Challenge::Bearer {
                realm: "https://auth/token".to_string(),
                service: Some("registry".to_string()),
                scope: None,
            })
        );
    }

    #[test]
    fn test_parse_basic_and_unknown() {
        assert_eq!(
            parse_challenge(r#"Basic realm="Registry Realm""#),
            Some(Challenge::Basic {
                realm: Some("Registry Realm".to_string())
            })
        );
        assert_eq!(parse_challenge("Negotiate"), None);
        // Bearer without a realm cannot be answered
        assert_eq!(parse_challenge(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_token_lifetime() {
        assert_eq!(token_lifetime(None), Duration::from_secs(270));
        assert_eq!(token_lifetime(Some(3600)), Duration::from_secs(3570));
        assert_eq!(token_lifetime(Some(60)), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_token_cache_reuses_until_expiry() {
        let cache = TokenCache::new();
        let key = TokenKey {
            realm: "https://auth/token".to_string(),
            service: Some("registry".to_string()),
            scope: Some("repo:pull".to_string()),
        };

        let first = cache
            .get_or_fetch(&key, || async { Ok(("t1".to_string(), Duration::from_secs(60))) })
            .await
            .unwrap();
        let second = cache
            .get_or_fetch(&key, || async { Ok(("t2".to_string(), Duration::from_secs(60))) })
            .await
            .unwrap();
        assert_eq!(first, "t1");
        assert_eq!(second, "t1");

        cache.invalidate(&key).await;
        let third = cache
            .get_or_fetch(&key, || async { Ok(("t3".to_string(), Duration::ZERO)) })
            .await
            .unwrap();
        assert_eq!(third, "t3");

        // Zero lifetime is already expired
        let fourth = cache
            .get_or_fetch(&key, || async { Ok(("t4".to_string(), Duration::from_secs(60))) })
            .await
            .unwrap();
        assert_eq!(fourth, "t4");
    }
}
