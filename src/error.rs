//! Error handling for the camera engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth_negotiator::AuthError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera unreachable, timed out or reset the connection
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// No usable challenge scheme, or a scheme downgrade
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Camera reported the operation as unsupported
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// External transcoder missing, exited or has no output yet
    #[error("Transcoder error: {0}")]
    Transcoder(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Peer not on the allow-list
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure should count against camera liveness
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Connectivity(_) | Error::Io(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            _ => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::Connectivity(msg) => (StatusCode::BAD_GATEWAY, "CONNECTIVITY_ERROR", msg.clone()),
            Error::Auth(e) => (StatusCode::BAD_GATEWAY, "AUTH_ERROR", e.to_string()),
            Error::UnsupportedFeature(msg) => (
                StatusCode::NOT_IMPLEMENTED,
                "UNSUPPORTED_FEATURE",
                msg.clone(),
            ),
            Error::Transcoder(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_YET_AVAILABLE",
                msg.clone(),
            ),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                e.to_string(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
