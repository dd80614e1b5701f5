//! Cross-instance coordination for connection admission.
//!
//! Every service instance talking to the same backend endpoint shares two
//! pieces of state through a Redis-compatible store:
//!
//! ```text
//! Reservoir refiller
//!     |
//!     +-- ConnectGate::admit
//!             |-- LeaseManager           (global connection ceiling)
//!             +-- DistributedRateLimiter (global connect rate)
//!                     |
//!                     +-- CoordinationStore (versioned compare-and-set)
//!                             |-- MemoryStore (process-local)
//!                             +-- RedisStore  (Dragonfly / Redis)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- versioned store trait and the in-memory implementation
//! - [`redis`] -- `Dragonfly`/Redis store with a Lua compare-and-set
//! - [`rate_limiter`] -- shared token bucket
//! - [`lease`] -- block-based connection ceiling with expiry-based recovery
//! - [`gate`] -- the admission decision combining both
//! - [`error`] -- shared error type

pub mod error;
pub mod gate;
pub mod lease;
pub mod rate_limiter;
pub mod redis;
pub mod store;

// Re-export primary types for convenience.
pub use error::CoordinationError;
pub use gate::{Admission, ConnectGate, CoordinatedGate, OpenGate};
pub use lease::{LeaseBlock, LeaseManager, LeaseSettings};
pub use rate_limiter::{BucketState, DistributedRateLimiter, RateDecision};
pub use redis::RedisStore;
pub use store::{CoordinationStore, MemoryStore, Versioned};
