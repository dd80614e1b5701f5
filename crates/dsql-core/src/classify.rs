//! Error classification for an optimistic-concurrency SQL backend.
//!
//! Every failed statement or commit is mapped to exactly one [`ErrorKind`].
//! The order of the checks is fixed:
//!
//! 1. a recognized condition-failure marker -> [`ErrorKind::ConditionFailed`]
//! 2. SQLSTATE `40001` (serialization failure) -> [`ErrorKind::Retryable`]
//! 3. SQLSTATE `0A000` (feature not supported) -> [`ErrorKind::UnsupportedFeature`]
//! 4. anything else -> [`ErrorKind::Permanent`]
//!
//! Step 1 is type-level: only error values that carry a condition failure
//! report it through [`Classify::kind`]. Steps 2-4 are covered by
//! [`classify_sqlstate`].
//!
//! Timeouts, I/O errors, and pool errors are deliberately `Permanent`.
//! Retrying them would hide overload instead of surfacing it.

use std::fmt;

/// SQLSTATE reported for serialization failures.
///
/// DSQL reports its optimistic-concurrency conflicts (`OC000` data
/// conflicts and `OC001` schema conflicts) under this state.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE reported when a statement uses an unsupported feature.
pub const FEATURE_NOT_SUPPORTED: &str = "0A000";

/// The outcome class of a failed backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A conditional write lost its race. Expected, never retried.
    ConditionFailed,
    /// A commit-time or statement-time serialization conflict.
    Retryable,
    /// The statement used something the backend cannot execute.
    UnsupportedFeature,
    /// Everything else.
    Permanent,
}

impl ErrorKind {
    /// Stable lowercase label, used for logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConditionFailed => "condition_failed",
            Self::Retryable => "retryable",
            Self::UnsupportedFeature => "unsupported_feature",
            Self::Permanent => "permanent",
        }
    }

    /// Whether the retry executor may replay the transaction.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a backend SQLSTATE code.
///
/// `None` (no code reported, e.g. an I/O error) is `Permanent`.
pub fn classify_sqlstate(code: Option<&str>) -> ErrorKind {
    match code {
        Some(SERIALIZATION_FAILURE) => ErrorKind::Retryable,
        Some(FEATURE_NOT_SUPPORTED) => ErrorKind::UnsupportedFeature,
        _ => ErrorKind::Permanent,
    }
}

/// Errors that can report their [`ErrorKind`].
///
/// Implementations must check for their own condition-failure marker
/// before falling back to [`classify_sqlstate`].
pub trait Classify {
    /// The classification of this error.
    fn kind(&self) -> ErrorKind;
}

impl Classify for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}
