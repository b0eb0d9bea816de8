//! Error types for channel and checkpoint operations

use thiserror::Error;

/// Result type for channel and checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during channel and checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A channel was read before any value reached it
    #[error("channel '{0}' is empty")]
    EmptyChannel(String),

    /// A batch of updates violated the channel's write policy
    #[error("invalid channel update: {0}")]
    InvalidUpdate(String),

    /// Checkpoint not found
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Storage backend error
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid checkpoint or configuration
    #[error("invalid checkpoint: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
