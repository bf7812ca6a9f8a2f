//! API error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::error::RuntimeError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Runtime(err) => match err {
                RuntimeError::Resolution(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "RESOLUTION_FAILED")
                }
                RuntimeError::StartupTimeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "STARTUP_TIMEOUT")
                }
                RuntimeError::UnreachableRemote { .. } => {
                    (StatusCode::BAD_GATEWAY, "UNREACHABLE_REMOTE")
                }
                RuntimeError::UnexpectedExit { .. } => (StatusCode::BAD_GATEWAY, "UNEXPECTED_EXIT"),
                RuntimeError::TunnelDisconnected => {
                    (StatusCode::SERVICE_UNAVAILABLE, "TUNNEL_DISCONNECTED")
                }
                RuntimeError::Protocol(_) => (StatusCode::BAD_GATEWAY, "PROTOCOL_ERROR"),
                RuntimeError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                RuntimeError::Remote(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
                RuntimeError::Spawn { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "SPAWN_FAILED"),
                RuntimeError::UnknownSession(_) => (StatusCode::NOT_FOUND, "UNKNOWN_SESSION"),
                RuntimeError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(code, "{}", self);
        } else {
            tracing::debug!(code, "{}", self);
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_map_to_gateway_statuses() {
        let cases = [
            (
                ApiError::from(RuntimeError::Resolution("r".into())),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(RuntimeError::UnreachableRemote {
                    url: "http://x".into(),
                    message: "refused".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::from(RuntimeError::TunnelDisconnected),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(RuntimeError::UnknownSession("py".into())),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
