//! Versioned key-value store used for cross-instance coordination.
//!
//! Every record carries a version that starts at `1` and increases by one
//! on each successful [`CoordinationStore::store_if`]. A writer reads a
//! record, computes the next state locally, and commits it with the version
//! it read. If another instance wrote in between, the write is rejected and
//! the caller re-reads. No lock is ever held across round trips.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dsql_core::Clock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CoordinationError;

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Record version. The first successful write produces `1`.
    pub version: u64,
    /// The stored value.
    pub value: T,
}

/// The version a successful conditional write produces.
pub const fn next_version(expected: Option<u64>) -> u64 {
    match expected {
        Some(v) => v.saturating_add(1),
        None => 1,
    }
}

/// A store offering single-round-trip compare-and-set on versioned records.
#[async_trait]
pub trait CoordinationStore: Send + Sync + Debug {
    /// Read the record at `key`, or `None` if it does not exist.
    async fn load(&self, key: &str) -> Result<Option<Versioned<String>>, CoordinationError>;

    /// Write `value` at `key` if the current version equals `expected`.
    ///
    /// `expected = None` means the key must not exist. On success the record
    /// version becomes [`next_version`]`(expected)` and the record expires
    /// after `ttl` unless written again. Returns `false` when the condition
    /// did not hold.
    async fn store_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError>;
}

/// Read and decode a JSON record.
///
/// # Errors
///
/// Returns [`CoordinationError::Serialization`] if the record is not valid
/// JSON for `T`, or any error from the store.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<Versioned<T>>, CoordinationError> {
    let Some(raw) = store.load(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw.value)?;
    Ok(Some(Versioned {
        version: raw.version,
        value,
    }))
}

/// Encode `value` as JSON and conditionally write it.
///
/// # Errors
///
/// Returns [`CoordinationError::Serialization`] if encoding fails, or any
/// error from the store.
pub async fn store_json_if<T: Serialize + Sync>(
    store: &dyn CoordinationStore,
    key: &str,
    expected: Option<u64>,
    value: &T,
    ttl: Duration,
) -> Result<bool, CoordinationError> {
    let json = serde_json::to_string(value)?;
    store.store_if(key, expected, &json, ttl).await
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    value: String,
    expires_at_ms: u64,
}

/// A process-local store for tests and single-instance deployments.
///
/// Expiry is evaluated lazily against the supplied [`Clock`].
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|e| e.expires_at_ms > now).count()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned<String>>, CoordinationError> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at_ms > now)
            .map(|e| Versioned {
                version: e.version,
                value: e.value.clone(),
            }))
    }

    async fn store_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let current = entries
            .get(key)
            .filter(|e| e.expires_at_ms > now)
            .map(|e| e.version);
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                version: next_version(expected),
                value: value.to_owned(),
                expires_at_ms: now.saturating_add(ttl_ms(ttl)),
            },
        );
        Ok(true)
    }
}
