//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    /// A log batch that does not start at the next stored index.
    LogOutOfOrder { expected: i64, got: i64 },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::LogOutOfOrder { expected, got } => (
                StatusCode::CONFLICT,
                json!({
                    "error": format!("log rows out of order: expected index {}, got {}", expected, got),
                    "expected_index": expected,
                }),
            ),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg }))
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<hopper_core::Error> for ApiError {
    fn from(err: hopper_core::Error) -> Self {
        match err {
            hopper_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            hopper_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            hopper_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            hopper_core::Error::Forbidden(msg) => ApiError::Forbidden(msg),
            hopper_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            hopper_core::Error::LogOutOfOrder { expected, got } => {
                ApiError::LogOutOfOrder { expected, got }
            }
            hopper_core::Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<hopper_db::DbError> for ApiError {
    fn from(err: hopper_db::DbError) -> Self {
        hopper_core::Error::from(err).into()
    }
}
