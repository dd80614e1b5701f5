//! Error types for the service binary.

use dsql_coordination::CoordinationError;
use dsql_core::ConfigError;
use dsql_persistence::DsqlError;

/// Errors that can occur while starting or running the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A metrics instrument could not be registered.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The coordination store is unreachable or misconfigured.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// The backend rejected a connection or query.
    #[error("database error: {0}")]
    Database(#[from] DsqlError),

    /// Failed to bind the metrics listener.
    #[error("bind error: {0}")]
    Bind(String),

    /// The metrics server failed while serving.
    #[error("serve error: {0}")]
    Serve(String),
}
