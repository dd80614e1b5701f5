//! Data layer for running `PostgreSQL` workloads on Aurora DSQL.
//!
//! DSQL speaks the `PostgreSQL` wire protocol but uses optimistic
//! concurrency, caps connection lifetime, and rate-limits new connections
//! cluster-wide. This crate bridges those differences:
//!
//! - [`factory`] -- token-authenticated connection creation
//! - [`reservoir`] -- warm buffer of ready connections with a guard window
//! - [`pool`] -- idle reuse and transactions over reservoir connections
//! - [`retry`] -- whole-transaction replay on serialization conflicts
//! - [`fencing`] -- conditional writes fenced on a token
//! - [`shard_store`] -- shard ownership records built on the above
//! - [`schema`] -- statement-at-a-time DDL for the bundled tables
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time checked)
//! to avoid requiring a live database at build time.

pub mod error;
pub mod factory;
pub mod fencing;
pub mod pool;
pub mod reservoir;
pub mod retry;
pub mod schema;
pub mod shard_store;
pub mod token;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience.
pub use error::DsqlError;
pub use factory::{ConnectionFactory, PgConnectionFactory, check_connectivity};
pub use fencing::{FencedUpdate, FencingToken, ReadLockMode, RelaxationAudit, check_fence, read_token};
pub use pool::{DsqlPool, DsqlTransaction, PgTransaction, PoolSettings, PooledConnection};
pub use reservoir::{DiscardReason, Reservoir, ReservoirConnection, ReservoirSettings};
pub use retry::{RetryExecutor, RetryPolicy, TransactionSource, TxBody, TxError};
pub use schema::{apply_schema, run_migrations};
pub use shard_store::{DsqlShardStore, NewShard, ShardRecord, ShardStore, SqlShardStore};
#[cfg(feature = "iam-auth")]
pub use token::IamTokenProvider;
pub use token::{StaticPassword, TokenProvider};
