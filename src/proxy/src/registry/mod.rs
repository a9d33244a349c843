pub mod auth;
pub mod blob;
pub mod manifest;
pub mod upstream;

pub use blob::{fill_blob, get_blob, head_blob, start_blob_fill};
pub use manifest::{
    get_manifest, head_manifest, resolve_manifest, resolve_untracked, ManifestSource,
};
pub use upstream::UpstreamClient;

use crate::error::ProxyError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Serialize)]
struct RegistryErrors {
    errors: Vec<RegistryErrorBody>,
}

#[derive(Serialize)]
struct RegistryErrorBody {
    code: &'static str,
    message: String,
}

/// Registry-shaped error response (`{"errors":[{"code","message"}]}`)
pub fn error_response(error: &ProxyError, unknown_code: &'static str) -> Response {
    let status = error.status_code();
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        tracing::error!(error = %error, "Request failed");
    }
    let body = RegistryErrors {
        errors: vec![RegistryErrorBody {
            code: error.registry_code(unknown_code),
            message: error.to_string(),
        }],
    };
    (status, Json(body)).into_response()
}

/// Same status as `error_response` without a body, for HEAD requests
pub fn head_error_response(error: &ProxyError) -> Response {
    error.status_code().into_response()
}
