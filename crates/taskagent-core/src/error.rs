//! Error types for `TaskAgent` core library.

use thiserror::Error;

/// Result type alias using `TaskAgent` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `TaskAgent` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IPC line could not be decoded
    #[error("Failed to decode IPC message: {0}")]
    Ipc(String),

    /// Routing address does not follow the dot grammar
    #[error("Malformed routing address: {0}")]
    Routing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
