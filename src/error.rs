//! # Error Handling
//!
//! One error enum for the whole gateway, and how it is turned into HTTP responses
//! and caller-facing error frames.
//!
//! ## Error taxonomy:
//! - **Configuration**: fatal, only raised at startup
//! - **UnknownAgent / UnknownConversation**: not-found, the stream keeps going
//! - **Connector**: a backend call failed; recovered, escalates after repeated failures
//! - **Authentication**: rejects the one request it arrived on
//! - **InvalidRequest**: the caller sent something the gateway cannot parse
//!
//! ## Key Rust Concepts:
//! - **thiserror**: derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - **`#[from]`**: enables `?` to convert subsystem errors into `GatewayError`
//! - **ResponseError trait**: converts errors to HTTP responses

use crate::auth::AuthError;
use crate::connectors::ConnectorError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("agent '{0}' not found")]
    UnknownAgent(String),

    #[error("conversation '{0}' not found")]
    UnknownConversation(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Machine-readable error code sent to callers.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::UnknownAgent(_) => "unknown_agent",
            GatewayError::UnknownConversation(_) => "unknown_conversation",
            GatewayError::Connector(_) => "connector_error",
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// Converts gateway errors into HTTP responses with a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "unknown_agent",
///     "message": "agent 'BotA' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnknownAgent(_) | GatewayError::UnknownConversation(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Connector(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Malformed JSON from a caller is always a client error.
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

/// Shorthand for `Result<T, GatewayError>`.
pub type AppResult<T> = Result<T, GatewayError>;
