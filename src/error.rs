//! # Error Handling
//!
//! Two error layers live here:
//!
//! - **EngineError**: failures raised inside the voice session engine (segmentation,
//!   transcription, backend round trips, control-channel parsing). None of these are
//!   fatal to the process; each category has a defined recovery described on the variant.
//! - **AppError**: failures surfaced through the HTTP API, converted into JSON responses.
//!
//! ## Key Rust Concepts:
//! - **thiserror**: Derives `Display` and `std::error::Error` from `#[error(...)]` attributes
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **From trait**: Lets `?` convert between error types automatically

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors raised by the session engine.
///
/// ## Recovery by category:
/// - **Transport**: the session is torn down, the manager keeps running
/// - **Model**: the current utterance is dropped, the segmenter continues
/// - **Backend**: the utterance's reply is lost (no retry), the session continues
/// - **Protocol**: the control message is ignored, metadata stays incomplete
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Short machine-readable code used in WebSocket error messages.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Transport(_) => "transport_error",
            EngineError::Model(_) => "model_error",
            EngineError::Backend(_) => "backend_error",
            EngineError::Protocol(_) => "protocol_error",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionLimit(_) => "session_limit",
            EngineError::InvalidAudio(_) => "invalid_audio",
            EngineError::Config(_) => "config_error",
        }
    }
}

/// Shorthand for results produced by the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Custom error types for the HTTP API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Conflict**: Request can't be served in the current state, e.g. capacity reached (409 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Conflict(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
        }
    }
}

/// Converts API errors into JSON responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session not found: 5f0c...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Engine failures that reach the HTTP layer.
impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            EngineError::SessionLimit(_) => AppError::Conflict(err.to_string()),
            EngineError::InvalidAudio(_) | EngineError::Protocol(_) => {
                AppError::BadRequest(err.to_string())
            }
            EngineError::Config(_) => AppError::ConfigError(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
