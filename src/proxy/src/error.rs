use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Registry error: {0}")]
    Registry(String),

    /// Upstream rejected us, even after one authenticated retry
    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),
}

impl From<cachedimage::ReferenceError> for ProxyError {
    fn from(e: cachedimage::ReferenceError) -> Self {
        ProxyError::InvalidReference(e.to_string())
    }
}

impl ProxyError {
    /// Status returned to pulling clients for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidReference(_) => StatusCode::BAD_REQUEST,
            ProxyError::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamUnavailable(_) | ProxyError::Http(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Config(_) | ProxyError::Registry(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Io(_) | ProxyError::Cache(_) | ProxyError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Registry API error code (distribution spec) for this failure
    pub fn registry_code(&self, unknown_code: &'static str) -> &'static str {
        match self {
            ProxyError::NotFound(_) => unknown_code,
            ProxyError::InvalidReference(_) => "NAME_INVALID",
            ProxyError::AuthRequired(_) => "UNAUTHORIZED",
            ProxyError::UpstreamUnavailable(_) | ProxyError::Http(_) => "UNAVAILABLE",
            _ => "UNKNOWN",
        }
    }

    /// Whether a cached copy may be served instead of this failure
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamUnavailable(_)
                | ProxyError::Http(_)
                | ProxyError::AuthRequired(_)
                | ProxyError::Registry(_)
        )
    }

    /// Rebuild this error for another waiter of a shared fetch.
    ///
    /// Wrapped library errors cannot be cloned, so they are carried over as
    /// their message under the variant that maps to the same status.
    pub fn replay(&self) -> ProxyError {
        match self {
            ProxyError::Io(e) => ProxyError::Cache(e.to_string()),
            ProxyError::Config(msg) => ProxyError::Config(msg.clone()),
            ProxyError::Http(e) => ProxyError::UpstreamUnavailable(e.to_string()),
            ProxyError::Serialization(e) => ProxyError::Cache(e.to_string()),
            ProxyError::Cache(msg) => ProxyError::Cache(msg.clone()),
            ProxyError::Registry(msg) => ProxyError::Registry(msg.clone()),
            ProxyError::AuthRequired(msg) => ProxyError::AuthRequired(msg.clone()),
            ProxyError::NotFound(msg) => ProxyError::NotFound(msg.clone()),
            ProxyError::UpstreamUnavailable(msg) => ProxyError::UpstreamUnavailable(msg.clone()),
            ProxyError::InvalidReference(msg) => ProxyError::InvalidReference(msg.clone()),
        }
    }
}
