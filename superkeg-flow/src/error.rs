//! Error types for superkeg-flow
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for the flow monitor
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Shared library errors (keg store, settings)
    #[error(transparent)]
    Common(#[from] superkeg_common::Error),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Edge source setup or read failure (GPIO export, sysfs access)
    #[error("Hardware error on channel {channel}: {message}")]
    Hardware { channel: u32, message: String },

    /// Calibration rejected; the previous factor is kept
    #[error("Invalid calibration: {0}")]
    CalibrationInvalid(String),

    /// No tapped keg with the given id
    #[error("Keg {0} not found or not tapped")]
    KegNotTapped(i64),

    /// Keg API unreachable or timed out
    #[error("Transport error: {0}")]
    Transport(String),

    /// Keg API answered with an unexpected status
    #[error("Keg API error {status}: {body}")]
    RemoteApi { status: u16, body: String },

    /// Operation on a tap that has no channel
    #[error("Tap {0} is not configured")]
    TapNotConfigured(u8),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using superkeg-flow Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse TOML: {}", e))
    }
}
