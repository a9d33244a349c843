use cachedimage::StoreError;
use proxy::ProxyError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{what} did not finish within {secs}s")]
    Timeout { what: String, secs: u64 },
}

impl ControllerError {
    /// Another writer changed the record; a prompt retry is expected to succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}
