//! Error types for the persistence layer.
//!
//! All errors are propagated via [`DsqlError`], which wraps the underlying
//! [`sqlx`] errors and carries the layer's own control-flow outcomes
//! (condition failures, pool exhaustion). [`Classify`] maps every variant to
//! the retry executor's four-way [`ErrorKind`].

use std::time::Duration;

use dsql_coordination::CoordinationError;
use dsql_core::{Classify, ErrorKind, classify_sqlstate};

/// Errors that can occur in the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum DsqlError {
    /// A fenced write matched no row: the target changed concurrently.
    #[error("target changed concurrently: {resource} no longer at token {expected}")]
    ConditionFailed {
        /// The fenced resource.
        resource: String,
        /// The token the writer presented.
        expected: i64,
    },

    /// A fenced write matched more than one row. Always a statement bug.
    #[error("fenced write on {resource} matched {rows} rows; the key predicate is not unique")]
    FenceNotUnique {
        /// The fenced resource.
        resource: String,
        /// Rows affected.
        rows: u64,
    },

    /// A fencing token cannot be advanced any further.
    #[error("fencing token {0} cannot be advanced")]
    TokenExhausted(i64),

    /// A row the operation requires does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schema statement failed.
    #[error("schema statement `{statement}` failed: {source}")]
    Schema {
        /// The start of the failing statement.
        statement: String,
        /// The database error.
        source: sqlx::Error,
    },

    /// A credential could not be produced.
    #[error("auth token error: {0}")]
    Token(String),

    /// Connecting took longer than the configured timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No pool slot became free within the acquire timeout.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The pool or reservoir has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The connection was already returned to the pool.
    #[error("connection already released")]
    ConnectionReleased,

    /// A coordination store operation failed.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DsqlError {
    /// The SQLSTATE of a database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Self::Database(e) => e
                .as_database_error()
                .and_then(|d| d.code())
                .map(|c| c.into_owned()),
            _ => None,
        }
    }

    /// Whether the underlying connection should be considered unusable.
    ///
    /// Database errors reported by the server leave the session intact;
    /// anything at the transport level does not.
    pub fn breaks_connection(&self) -> bool {
        match self {
            Self::Database(e) => e.as_database_error().is_none(),
            Self::ConnectTimeout(_) => true,
            _ => false,
        }
    }
}

impl Classify for DsqlError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ConditionFailed { .. } => ErrorKind::ConditionFailed,
            Self::Database(_) => classify_sqlstate(self.sqlstate().as_deref()),
            _ => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_failure_is_checked_first() {
        let err = DsqlError::ConditionFailed {
            resource: "shard 1".to_owned(),
            expected: 5,
        };
        assert_eq!(err.kind(), ErrorKind::ConditionFailed);
        assert!(err.to_string().contains("changed concurrently"));
    }

    #[test]
    fn non_database_errors_are_permanent() {
        assert_eq!(
            DsqlError::FenceNotUnique {
                resource: "shard 1".to_owned(),
                rows: 2
            }
            .kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            DsqlError::PoolTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(DsqlError::Database(sqlx::Error::PoolTimedOut).kind(), ErrorKind::Permanent);
    }

    #[test]
    fn transport_errors_break_the_connection() {
        let io = sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(DsqlError::Database(io).breaks_connection());
        assert!(!DsqlError::NotFound("x".to_owned()).breaks_connection());
    }
}
