use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing sandbox parameter. Use ?sandbox=userId or /clients/userId/")]
    MissingIdentity,
    #[error("Sandbox not found for user: {0}")]
    SandboxNotFound(String),
    #[error("Sandbox unavailable")]
    SandboxUnavailable,
    #[error("Connection rejected: remote connections disabled")]
    RemoteRejected,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("command '{command}' timed out after {timeout:?}")]
    CommandTimedOut { command: String, timeout: Duration },
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Body of every error response: `{"error": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingIdentity => StatusCode::BAD_REQUEST,
            GatewayError::SandboxNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::SandboxUnavailable => StatusCode::BAD_GATEWAY,
            GatewayError::RemoteRejected => StatusCode::FORBIDDEN,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::CommandFailed { .. }
            | GatewayError::CommandTimedOut { .. }
            | GatewayError::Spawn(_)
            | GatewayError::Registry(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_sandbox() {
        let err = GatewayError::SandboxNotFound("unknown-id".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.body().error.contains("unknown-id"));
    }

    #[test]
    fn identity_error_explains_both_forms() {
        let err = GatewayError::MissingIdentity;
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let text = err.to_string();
        assert!(text.contains("?sandbox="));
        assert!(text.contains("/clients/"));
    }

    #[test]
    fn infrastructure_errors_map_to_500() {
        let err = GatewayError::CommandFailed {
            command: "lxc list".into(),
            message: "boom".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
