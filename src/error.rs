//! Error types for echolocate
//!
//! Core computations (detector, solver, sync, correlator) never error on
//! bad data; they return tagged outcomes. This error type covers the
//! boundary: configuration, validation, and transport.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the echolocate service
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request (400, no state mutation)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unexpected internal failure (500)
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the echolocate Error
pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal server error",
                    "details": other.to_string(),
                })),
            )
                .into_response(),
        }
    }
}
