//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent `{error, message}` body across all
//! endpoints, mapping engine errors to HTTP status codes.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use civicline_core::CivicError;
use civicline_engine::SessionError;

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid input.
    BadRequest(String),
    /// 404 Not Found - conversation or user does not exist.
    NotFound(String),
    /// 409 Conflict - concurrent creation or a closed conversation.
    Conflict(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
    /// 503 Service Unavailable - storage not reachable.
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<CivicError> for ApiError {
    fn from(err: CivicError) -> Self {
        match &err {
            CivicError::NotFound(msg) => ApiError::NotFound(msg.clone()),
            CivicError::Conflict(_) | CivicError::StaleWrite { .. } | CivicError::AppendOnly(_) => {
                ApiError::Conflict(err.to_string())
            }
            CivicError::Storage(_) | CivicError::Io(_) => ApiError::ServiceUnavailable(err.to_string()),
            CivicError::Config(msg) => ApiError::BadRequest(msg.clone()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SessionError::Conflict { .. }
            | SessionError::Ended(_)
            | SessionError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            SessionError::EmptyMessage
            | SessionError::MessageTooLong(_)
            | SessionError::Channel(_) => ApiError::BadRequest(err.to_string()),
            SessionError::Storage(inner) => ApiError::from(inner),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
