//! Shared building blocks for the DSQL compatibility layer.
//!
//! Everything in this crate is backend-agnostic: it knows nothing about
//! `sqlx` connections or the coordination store, so both the persistence
//! and coordination crates can depend on it.
//!
//! # Modules
//!
//! - [`classify`] -- four-way error classification (`ConditionFailed`,
//!   `Retryable`, `UnsupportedFeature`, `Permanent`)
//! - [`clock`] -- wall-clock abstraction for shared-state timestamps
//! - [`config`] -- typed YAML configuration with environment overrides
//! - [`metrics`] -- Prometheus instruments for reservoir, retry, and
//!   coordination state

pub mod classify;
pub mod clock;
pub mod config;
pub mod metrics;

// Re-export primary types for convenience.
pub use classify::{Classify, ErrorKind, classify_sqlstate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, DsqlConfig};
pub use metrics::Metrics;
