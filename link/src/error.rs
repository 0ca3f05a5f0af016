//! Error types for pv-link.

use thiserror::Error;

/// Errors surfaced by pv-link operations.
///
/// Transport failures inside the live channel never reach callers as errors;
/// they show up as connection-state changes and `on_error` events instead.
/// This type covers the request/response paths (REST fallback, heartbeat
/// check, configuration) and the handful of channel calls that can fail
/// synchronously.
#[derive(Error, Debug)]
pub enum PvLinkError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Server error ({status_code}): {message}")]
    ServerError { status_code: u16, message: String },

    #[error("Live channel is not running")]
    ChannelClosed,
}

impl From<serde_json::Error> for PvLinkError {
    fn from(err: serde_json::Error) -> Self {
        PvLinkError::SerializationError(err.to_string())
    }
}

/// Result type for pv-link operations
pub type Result<T> = std::result::Result<T, PvLinkError>;
