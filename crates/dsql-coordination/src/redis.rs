//! `Dragonfly`/Redis-backed [`CoordinationStore`].
//!
//! Each record is a hash with two fields:
//!
//! | Field | Type | Description |
//! |-------|------|-------------|
//! | `v` | Integer | Record version |
//! | `d` | String | JSON payload |
//!
//! The compare-and-set runs as one Lua script, so the version check, the
//! write, and the `PEXPIRE` happen atomically on the server.

use std::time::Duration;

use async_trait::async_trait;
use fred::interfaces::LuaInterface;
use fred::prelude::*;

use crate::error::CoordinationError;
use crate::store::{CoordinationStore, Versioned};

/// `KEYS[1]` = record key.
/// `ARGV[1]` = expected version (empty string = key must be absent).
/// `ARGV[2]` = payload. `ARGV[3]` = TTL in milliseconds.
const CAS_SCRIPT: &str = r"
local cur = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == '' then
  if cur then return 0 end
elseif (not cur) or cur ~= ARGV[1] then
  return 0
end
local nextv = 1
if cur then nextv = tonumber(cur) + 1 end
redis.call('HSET', KEYS[1], 'v', nextv, 'd', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
";

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the store at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Config`] if the URL cannot be parsed.
    /// Returns [`CoordinationError::Store`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, CoordinationError> {
        let config = Config::from_url(url)
            .map_err(|e| CoordinationError::Config(format!("invalid coordination URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("connected to coordination store");
        Ok(Self { client })
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Store`] if the quit command fails.
    pub async fn close(&self) -> Result<(), CoordinationError> {
        self.client.quit().await?;
        Ok(())
    }

    /// Delete a key. Used by tests and operational tooling.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Store`] if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        let _: u32 = self.client.del(key).await?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned<String>>, CoordinationError> {
        let fields: Vec<Option<String>> = self.client.hmget(key, vec!["v", "d"]).await?;
        match fields.as_slice() {
            [Some(version), Some(value)] => {
                let version = version.parse().map_err(|e| CoordinationError::Malformed {
                    key: key.to_owned(),
                    message: format!("version is not an integer: {e}"),
                })?;
                Ok(Some(Versioned {
                    version,
                    value: value.clone(),
                }))
            }
            [None, None] | [] => Ok(None),
            _ => Err(CoordinationError::Malformed {
                key: key.to_owned(),
                message: "record is missing its version or payload".to_owned(),
            }),
        }
    }

    async fn store_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let written: i64 = self
            .client
            .eval(
                CAS_SCRIPT,
                vec![key],
                vec![expected, value.to_owned(), ttl_ms.to_string()],
            )
            .await?;
        Ok(written == 1)
    }
}
