//! Common error types for SuperKeg

use thiserror::Error;

/// Common result type for SuperKeg operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across SuperKeg processes
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tap position already held by another tapped keg
    #[error("Tap {tap} already occupied by keg {occupant}")]
    TapConflict { tap: u8, occupant: i64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
