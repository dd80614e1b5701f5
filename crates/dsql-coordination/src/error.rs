//! Error types for the coordination layer.
//!
//! All errors are propagated via [`CoordinationError`], which wraps the
//! underlying [`fred`] and [`serde_json`] errors.

/// Errors that can occur while reading or writing shared coordination state.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// A `Dragonfly`/Redis operation failed.
    #[error("coordination store error: {0}")]
    Store(#[from] fred::error::Error),

    /// A stored record could not be encoded or decoded.
    #[error("coordination record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record had an unexpected shape.
    #[error("malformed coordination record at {key}: {message}")]
    Malformed {
        /// The store key.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// Conditional writes kept losing to other instances.
    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention {
        /// The contended key.
        key: String,
        /// Number of conditional writes attempted.
        attempts: u32,
    },

    /// A configuration error.
    #[error("coordination configuration error: {0}")]
    Config(String),
}
