//! Service wiring for the DSQL compatibility layer.
//!
//! - [`startup`] -- builds the token provider, connection factory,
//!   coordination gate, reservoir, and pool from [`DsqlConfig`](dsql_core::DsqlConfig)
//! - [`server`] -- `GET /metrics` Prometheus endpoint
//! - [`error`] -- service-level error type

pub mod error;
pub mod server;
pub mod startup;

pub use error::ServiceError;
pub use startup::{Pool, Service};
