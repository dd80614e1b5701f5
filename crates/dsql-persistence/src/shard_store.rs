//! Shard ownership records.
//!
//! A shard row carries its owner and a `range_id` fencing token. Every
//! mutation is fenced on the `range_id` the writer last read; taking over a
//! shard writes `range_id + 1`, so a previous owner still holding the old
//! value loses its next write.
//!
//! [`SqlShardStore`] is the plain `PostgreSQL` implementation with
//! `SELECT ... FOR UPDATE` locking reads. [`DsqlShardStore`] wraps any
//! [`ShardStore`], keeps every operation it does not change, and decides per
//! operation through a [`RelaxationAudit`] whether the locking read may be
//! dropped. It also runs whole mutations through the [`RetryExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::error::DsqlError;
use crate::fencing::{FencedUpdate, FencingToken, ReadLockMode, RelaxationAudit};
use crate::pool::PgTransaction;
use crate::retry::{RetryExecutor, TransactionSource, TxError};

/// Operation name used for the locking range read.
pub const READ_RANGE_OPERATION: &str = "read_range_for_update";

/// A row of the `shards` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Shard identifier.
    pub shard_id: i64,
    /// Fencing token for ownership.
    pub range_id: FencingToken,
    /// Current owner.
    pub owner: String,
    /// Opaque shard state.
    pub data: serde_json::Value,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

// `data` is stored as JSON text.
impl<'r> sqlx::FromRow<'r, PgRow> for ShardRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let data: String = row.try_get("data")?;
        Ok(Self {
            shard_id: row.try_get("shard_id")?,
            range_id: row.try_get("range_id")?,
            owner: row.try_get("owner")?,
            data: decode_data(&data)?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_data(text: &str) -> Result<serde_json::Value, sqlx::Error> {
    serde_json::from_str(text).map_err(|e| sqlx::Error::ColumnDecode {
        index: "data".to_owned(),
        source: Box::new(e),
    })
}

/// Fields for a new shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewShard {
    /// Shard identifier.
    pub shard_id: i64,
    /// Initial owner.
    pub owner: String,
    /// Initial state.
    pub data: serde_json::Value,
}

/// Connection-level shard operations.
#[async_trait]
pub trait ShardStore: Send + Sync + std::fmt::Debug + 'static {
    /// Insert a shard with `range_id` 1.
    async fn create_shard(&self, conn: &mut PgConnection, shard: &NewShard) -> Result<ShardRecord, DsqlError>;

    /// Read a shard without locking.
    async fn get_shard(&self, conn: &mut PgConnection, shard_id: i64) -> Result<Option<ShardRecord>, DsqlError>;

    /// Read a shard's `range_id` ahead of a write.
    async fn read_range_for_update(&self, conn: &mut PgConnection, shard_id: i64) -> Result<FencingToken, DsqlError>;

    /// Replace a shard's data, fenced on `expected`.
    async fn update_shard(
        &self,
        conn: &mut PgConnection,
        shard_id: i64,
        expected: FencingToken,
        data: &serde_json::Value,
    ) -> Result<(), DsqlError>;

    /// Take over a shard, fenced on `expected`. Returns the new `range_id`.
    async fn steal_shard(
        &self,
        conn: &mut PgConnection,
        shard_id: i64,
        expected: FencingToken,
        new_owner: &str,
    ) -> Result<FencingToken, DsqlError>;
}

fn resource(shard_id: i64) -> String {
    format!("shard {shard_id}")
}

async fn read_range(
    conn: &mut PgConnection,
    shard_id: i64,
    mode: ReadLockMode,
) -> Result<FencingToken, DsqlError> {
    let sql = format!(
        "SELECT range_id FROM shards WHERE shard_id = $1{}",
        mode.suffix()
    );
    sqlx::query_scalar::<_, FencingToken>(&sql)
        .bind(shard_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DsqlError::NotFound(resource(shard_id)))
}

/// Plain `PostgreSQL` shard store.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlShardStore;

#[async_trait]
impl ShardStore for SqlShardStore {
    async fn create_shard(&self, conn: &mut PgConnection, shard: &NewShard) -> Result<ShardRecord, DsqlError> {
        let record = sqlx::query_as::<_, ShardRecord>(
            r"INSERT INTO shards (shard_id, range_id, owner, data, updated_at)
              VALUES ($1, 1, $2, $3, NOW())
              RETURNING shard_id, range_id, owner, data, updated_at",
        )
        .bind(shard.shard_id)
        .bind(&shard.owner)
        .bind(serde_json::to_string(&shard.data)?)
        .fetch_one(conn)
        .await?;

        tracing::info!(shard_id = shard.shard_id, owner = %shard.owner, "created shard");
        Ok(record)
    }

    async fn get_shard(&self, conn: &mut PgConnection, shard_id: i64) -> Result<Option<ShardRecord>, DsqlError> {
        let record = sqlx::query_as::<_, ShardRecord>(
            r"SELECT shard_id, range_id, owner, data, updated_at
              FROM shards
              WHERE shard_id = $1",
        )
        .bind(shard_id)
        .fetch_optional(conn)
        .await?;
        Ok(record)
    }

    async fn read_range_for_update(&self, conn: &mut PgConnection, shard_id: i64) -> Result<FencingToken, DsqlError> {
        read_range(conn, shard_id, ReadLockMode::ForUpdate).await
    }

    async fn update_shard(
        &self,
        conn: &mut PgConnection,
        shard_id: i64,
        expected: FencingToken,
        data: &serde_json::Value,
    ) -> Result<(), DsqlError> {
        FencedUpdate::table("shards", resource(shard_id))
            .set("data", serde_json::to_string(data)?)
            .set_expr("updated_at", "NOW()")
            .where_key("shard_id", shard_id)
            .fenced("range_id", expected)
            .execute(conn)
            .await
    }

    async fn steal_shard(
        &self,
        conn: &mut PgConnection,
        shard_id: i64,
        expected: FencingToken,
        new_owner: &str,
    ) -> Result<FencingToken, DsqlError> {
        let next = expected.next()?;
        FencedUpdate::table("shards", resource(shard_id))
            .set("range_id", next)
            .set("owner", new_owner.to_owned())
            .set_expr("updated_at", "NOW()")
            .where_key("shard_id", shard_id)
            .fenced("range_id", expected)
            .execute(conn)
            .await?;
        tracing::info!(shard_id, owner = new_owner, range_id = next.value(), "shard ownership changed");
        Ok(next)
    }
}

/// Shard store adapted to optimistic concurrency.
///
/// Delegates to `B` except for the locking range read, whose mode comes
/// from the audit.
#[derive(Debug)]
pub struct DsqlShardStore<B> {
    base: Arc<B>,
    audit: Arc<RelaxationAudit>,
}

impl<B> Clone for DsqlShardStore<B> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            audit: Arc::clone(&self.audit),
        }
    }
}

impl<B: ShardStore> DsqlShardStore<B> {
    /// Wrap `base`, relaxing only what `audit` allows.
    pub fn new(base: B, audit: RelaxationAudit) -> Self {
        Self {
            base: Arc::new(base),
            audit: Arc::new(audit),
        }
    }

    /// The wrapped store.
    pub fn base(&self) -> &B {
        &self.base
    }

    /// The relaxation decisions in force.
    pub fn audit(&self) -> &RelaxationAudit {
        &self.audit
    }

    /// Replace a shard's data in a retried transaction, fenced on the
    /// caller's `expected` token.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::ConditionFailed`] if the shard changed hands
    /// since `expected` was read, or another [`TxError`] outcome.
    pub async fn update_shard_data<S>(
        &self,
        executor: &RetryExecutor<S>,
        shard_id: i64,
        expected: FencingToken,
        data: serde_json::Value,
    ) -> Result<(), TxError<DsqlError>>
    where
        S: TransactionSource<Error = DsqlError>,
        S::Tx: PgTransaction,
    {
        let data = Arc::new(data);
        executor
            .run("update_shard", |tx: &mut S::Tx| {
                let store = self.clone();
                let data = Arc::clone(&data);
                async move {
                    let conn = tx.pg()?;
                    store.update_shard(conn, shard_id, expected, &data).await
                }
                .boxed()
            })
            .await
    }

    /// Take over a shard in a retried transaction: read its `range_id`,
    /// then write `range_id + 1` fenced on the value read.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::ConditionFailed`] if another owner won the race,
    /// or another [`TxError`] outcome.
    pub async fn steal<S>(
        &self,
        executor: &RetryExecutor<S>,
        shard_id: i64,
        new_owner: &str,
    ) -> Result<FencingToken, TxError<DsqlError>>
    where
        S: TransactionSource<Error = DsqlError>,
        S::Tx: PgTransaction,
    {
        let owner: Arc<str> = Arc::from(new_owner);
        executor
            .run("steal_shard", |tx: &mut S::Tx| {
                let store = self.clone();
                let owner = Arc::clone(&owner);
                async move {
                    let conn = tx.pg()?;
                    let observed = store.read_range_for_update(&mut *conn, shard_id).await?;
                    store.steal_shard(conn, shard_id, observed, &owner).await
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl<B: ShardStore> ShardStore for DsqlShardStore<B> {
    async fn create_shard(&self, conn: &mut PgConnection, shard: &NewShard) -> Result<ShardRecord, DsqlError> {
        self.base.create_shard(conn, shard).await
    }

    async fn get_shard(&self, conn: &mut PgConnection, shard_id: i64) -> Result<Option<ShardRecord>, DsqlError> {
        self.base.get_shard(conn, shard_id).await
    }

    async fn read_range_for_update(&self, conn: &mut PgConnection, shard_id: i64) -> Result<FencingToken, DsqlError> {
        match self.audit.mode_for(READ_RANGE_OPERATION) {
            ReadLockMode::ForUpdate => self.base.read_range_for_update(conn, shard_id).await,
            ReadLockMode::Plain => read_range(conn, shard_id, ReadLockMode::Plain).await,
        }
    }

    async fn update_shard(
        &self,
        conn: &mut PgConnection,
        shard_id: i64,
        expected: FencingToken,
        data: &serde_json::Value,
    ) -> Result<(), DsqlError> {
        self.base.update_shard(conn, shard_id, expected, data).await
    }

    async fn steal_shard(
        &self,
        conn: &mut PgConnection,
        shard_id: i64,
        expected: FencingToken,
        new_owner: &str,
    ) -> Result<FencingToken, DsqlError> {
        self.base.steal_shard(conn, shard_id, expected, new_owner).await
    }
}
