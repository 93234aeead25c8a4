//! Error types for NeuraMemory.
//!
//! Library crates use [`NeuraMemoryError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all NeuraMemory operations.
#[derive(Debug, thiserror::Error)]
pub enum NeuraMemoryError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the LLM provider.
    #[error("network error: {0}")]
    Network(String),

    /// Structured fact store or vector index error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Classifier call failed or returned an unusable result.
    #[error("classification error: {0}")]
    Classification(String),

    /// Embedding generation failed.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown category, malformed record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, NeuraMemoryError>;

impl NeuraMemoryError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
