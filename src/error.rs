//! Error types for the Filesender server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StoreError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Error response body
#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::RangeNotSatisfiable(msg) => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                "range_not_satisfiable",
                msg.clone(),
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Storage(e) => match e {
                StoreError::NotFound { .. } => (
                    StatusCode::NOT_FOUND,
                    "not_found",
                    "Could not find file".to_string(),
                ),
                StoreError::InvalidId(_) => (
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "File ID is invalid".to_string(),
                ),
                _ => {
                    e.log_failure("Storage error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "storage_error",
                        "Storage error".to_string(),
                    )
                }
            },
        };

        (status, Json(ErrorResponse::new(error_type, message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ids::IdError;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                AppError::Storage(StoreError::InvalidId(IdError::InvalidFormat)),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Storage(StoreError::Io {
                    op: "write blob",
                    owner_id: "o".into(),
                    file_id: "f".into(),
                    source: std::io::Error::other("disk full"),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
