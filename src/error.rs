//! # Error Handling
//!
//! This module defines custom error types and how they're converted to HTTP responses.
//!
//! ## Error Categories:
//! - **Internal**: Server-side problems (500 errors)
//! - **BadRequest**: Client sent invalid data (400 errors)
//! - **NotFound**: Requested resource doesn't exist (404 errors)
//! - **ConfigError**: Configuration problems (500 errors)
//!
//! These cover the plain HTTP surface only. Per-session relay errors never go
//! through this type: malformed client input is dropped where it arrives, and
//! upstream stream failures are reported to the client as `{"error": ...}`
//! text frames on the WebSocket itself.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (engine construction failures, lock issues, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

/// Defines how errors are formatted as human-readable strings.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Converts our custom errors into HTTP responses that clients can understand.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Invalid JSON",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Map each error type to HTTP status code, error type, and message
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
        };

        // Build the HTTP response with JSON body
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request) response, not a 500 (Internal Server Error).
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
///
/// ## When this happens:
/// - config.toml file has invalid syntax
/// - Configuration values fail deserialization
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
