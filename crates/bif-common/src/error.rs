//! Error types shared across BIF crates

use thiserror::Error;

/// Result type alias for BIF common operations
pub type Result<T> = std::result::Result<T, BifError>;

/// Main error type for shared BIF utilities
#[derive(Error, Debug)]
pub enum BifError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Malformed checksum sidecar {path}: {reason}")]
    MalformedSidecar { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BifError {
    /// Build a configuration error from anything printable
    pub fn config(message: impl Into<String>) -> Self {
        BifError::Config(message.into())
    }
}
