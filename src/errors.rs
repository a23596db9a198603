//! Error types for the collector and monitor.
//!
//! One enum covers both processes; most failures are handled locally
//! (logged, reconnected, or surfaced as a health signal) rather than
//! propagated to the top.

use thiserror::Error;

/// Main error type for the feed collector and its watchdog.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// WebSocket connection errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CollectorError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type alias using CollectorError.
pub type Result<T> = std::result::Result<T, CollectorError>;
