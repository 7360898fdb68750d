//! Structured HTTP errors for the control plane.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Control-plane error type with structured JSON responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Categorize a service-layer error by message shape, the same way the
    /// RPC surface does.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let lower = message.to_lowercase();
        if lower.contains("not found") {
            Self::NotFound(message)
        } else if lower.contains("invalid") || lower.contains("already exists") {
            Self::BadRequest(message)
        } else {
            Self::Internal(message)
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();
        match &self {
            ApiError::Internal(msg) => error!(error_code = code, message = %msg, "control-plane error"),
            ApiError::Unauthorized(msg) => warn!(error_code = code, message = %msg, "control-plane auth failure"),
            _ => tracing::debug!(error_code = code, message = %message, "control-plane client error"),
        }
        (status, Json(ErrorBody { error: message, code })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::bad_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::unauthorized("x").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_from_anyhow_categorization() {
        let err = ApiError::from_anyhow(anyhow::anyhow!("tenant 'x' not found"));
        assert!(matches!(err, ApiError::NotFound(_)));
        let err = ApiError::from_anyhow(anyhow::anyhow!("invalid tenant id 'X'"));
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = ApiError::from_anyhow(anyhow::anyhow!("disk exploded"));
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
