//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps various error
//! sources and implements proper HTTP response conversion.

use crate::core::error_types::{
    ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION, ERROR_TYPE_INVALID_REQUEST, ERROR_TYPE_OVERLOADED,
    ERROR_TYPE_RATE_LIMIT, ERROR_TYPE_TIMEOUT,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (missing env vars, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database errors from sqlx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Authentication/authorization failures
    #[error("Unauthorized")]
    Unauthorized,

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Stored-secret decryption failed for one specific record
    #[error("Secret decryption failed for {context}")]
    SecretDecryption { context: String },

    /// Upstream request exceeded the upstream's configured timeout
    #[error("upstream request timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    /// All routing candidates were exhausted without a successful response
    #[error("No upstream available for {capability}: {last_error}")]
    NoUpstreamAvailable {
        capability: String,
        last_error: String,
    },

    /// Rate limit exceeded errors
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Client disconnected before request completed
    /// This is a normal scenario (user cancelled request, timeout, etc.)
    #[error("Client closed request")]
    ClientDisconnect,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, error_message) = match self {
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_TYPE_API,
                e.to_string(),
            ),
            AppError::Request(e) => {
                let status = if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, ERROR_TYPE_API, e.to_string())
            }
            AppError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_TYPE_API,
                e.to_string(),
            ),
            AppError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_TYPE_API,
                e.to_string(),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ERROR_TYPE_AUTHENTICATION,
                "Unauthorized".to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST, msg),
            AppError::SecretDecryption { context } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_TYPE_API,
                format!("Secret decryption failed for {}", context),
            ),
            AppError::UpstreamTimeout { timeout_secs } => (
                StatusCode::GATEWAY_TIMEOUT,
                ERROR_TYPE_TIMEOUT,
                format!("upstream request timed out after {}s", timeout_secs),
            ),
            AppError::NoUpstreamAvailable {
                capability,
                last_error,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ERROR_TYPE_OVERLOADED,
                format!("No upstream available for {}: {}", capability, last_error),
            ),
            AppError::RateLimitExceeded(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, ERROR_TYPE_RATE_LIMIT, msg)
            }
            AppError::ClientDisconnect => {
                // HTTP 408 Request Timeout per RFC 7231, more compatible than nginx's 499
                tracing::info!("Client disconnected before request completed");
                (
                    StatusCode::REQUEST_TIMEOUT,
                    ERROR_TYPE_API,
                    "Client closed request".to_string(),
                )
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API, msg),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
