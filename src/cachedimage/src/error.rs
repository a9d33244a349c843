use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,

    #[error("invalid image reference {0:?}: {1}")]
    Invalid(String, &'static str),
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// The record changed since it was read (stale resourceVersion)
    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("gave up updating {name} after {attempts} conflicting attempts")]
    ConflictRetry { name: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(kube::Error),

    #[error("Store error: {0}")]
    Api(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::ConflictRetry { .. })
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    StoreError::AlreadyExists(response.message.clone())
                } else {
                    StoreError::Conflict(response.message.clone())
                }
            }
            kube::Error::Api(response) if response.code == 404 => {
                StoreError::NotFound(response.message.clone())
            }
            _ => StoreError::Kube(err),
        }
    }
}
