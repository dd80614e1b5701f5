//! Fenced conditional writes.
//!
//! Under optimistic concurrency a read takes no lock, so a writer cannot
//! assume the row is still as it saw it. Every mutation instead carries the
//! fencing token it last read, and the `UPDATE` only matches if the stored
//! token is still that value:
//!
//! ```sql
//! UPDATE shards SET range_id = $1, data = $2
//!  WHERE shard_id = $3 AND range_id = $4
//! ```
//!
//! - 0 rows: someone else won. [`DsqlError::ConditionFailed`], which the
//!   retry executor never retries.
//! - 1 row: committed.
//! - more: the key predicate is not unique. [`DsqlError::FenceNotUnique`].
//!
//! [`FencedUpdate`] is a typestate builder over [`sqlx::QueryBuilder`]: SET
//! clauses can only precede the key predicate, and only a statement with a
//! fence predicate can be executed.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use sqlx::{Encode, PgConnection, Postgres, QueryBuilder, Type};

use crate::error::DsqlError;

/// The value a fenced write expects to find in the token column.
///
/// Always the exact value last read, never one computed from it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct FencingToken(i64);

impl FencingToken {
    /// Wrap a token value read from the backend.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// The raw value.
    pub const fn value(self) -> i64 {
        self.0
    }

    /// The token a successful ownership change writes.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::TokenExhausted`] at `i64::MAX`; rewriting the
    /// same value would leave the previous holder unfenced.
    pub const fn next(self) -> Result<Self, DsqlError> {
        match self.0.checked_add(1) {
            Some(next) => Ok(Self(next)),
            None => Err(DsqlError::TokenExhausted(self.0)),
        }
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map the affected-row count of a fenced write to its outcome.
///
/// # Errors
///
/// Returns [`DsqlError::ConditionFailed`] for zero rows and
/// [`DsqlError::FenceNotUnique`] for more than one.
pub fn check_fence(rows: u64, resource: &str, expected: FencingToken) -> Result<(), DsqlError> {
    match rows {
        1 => Ok(()),
        0 => {
            tracing::debug!(resource, expected = expected.value(), "fenced write lost");
            Err(DsqlError::ConditionFailed {
                resource: resource.to_owned(),
                expected: expected.value(),
            })
        }
        rows => {
            tracing::error!(resource, rows, "fenced write matched more than one row");
            Err(DsqlError::FenceNotUnique {
                resource: resource.to_owned(),
                rows,
            })
        }
    }
}

// =============================================================================
// Statement builder
// =============================================================================

/// No SET clause yet.
#[derive(Debug)]
pub struct NeedsSet;
/// At least one SET clause.
#[derive(Debug)]
pub struct Setting;
/// Key predicate present.
#[derive(Debug)]
pub struct Keyed;
/// Fence predicate present; ready to run.
#[derive(Debug)]
pub struct Fenced;

/// A fenced `UPDATE` under construction.
pub struct FencedUpdate<'a, S> {
    builder: QueryBuilder<'a, Postgres>,
    resource: String,
    expected: FencingToken,
    _state: PhantomData<S>,
}

impl<S> std::fmt::Debug for FencedUpdate<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FencedUpdate")
            .field("sql", &self.builder.sql())
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl<'a, S> FencedUpdate<'a, S> {
    fn into_state<N>(self) -> FencedUpdate<'a, N> {
        FencedUpdate {
            builder: self.builder,
            resource: self.resource,
            expected: self.expected,
            _state: PhantomData,
        }
    }

    fn push_assignment<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres>,
    {
        self.builder.push(column).push(" = ").push_bind(value);
        self
    }
}

impl<'a> FencedUpdate<'a, NeedsSet> {
    /// Start an `UPDATE` on `table`. `resource` names the fenced entity in
    /// errors and logs.
    pub fn table(table: &'static str, resource: impl Into<String>) -> Self {
        Self {
            builder: QueryBuilder::new(format!("UPDATE {table} SET ")),
            resource: resource.into(),
            expected: FencingToken::new(0),
            _state: PhantomData,
        }
    }

    /// Assign a bound value to `column`.
    pub fn set<T>(self, column: &'static str, value: T) -> FencedUpdate<'a, Setting>
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres>,
    {
        self.push_assignment(column, value).into_state()
    }

    /// Assign a fixed SQL expression, such as `NOW()`, to `column`.
    pub fn set_expr(mut self, column: &'static str, expr: &'static str) -> FencedUpdate<'a, Setting> {
        self.builder.push(column).push(" = ").push(expr);
        self.into_state()
    }
}

impl<'a> FencedUpdate<'a, Setting> {
    /// Assign a bound value to another column.
    #[must_use]
    pub fn set<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres>,
    {
        self.builder.push(", ");
        self.push_assignment(column, value)
    }

    /// Assign a fixed SQL expression to another column.
    #[must_use]
    pub fn set_expr(mut self, column: &'static str, expr: &'static str) -> Self {
        self.builder.push(", ").push(column).push(" = ").push(expr);
        self
    }

    /// Begin the WHERE clause with the row's unique key.
    pub fn where_key<T>(mut self, column: &'static str, value: T) -> FencedUpdate<'a, Keyed>
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres>,
    {
        self.builder.push(" WHERE ").push(column).push(" = ").push_bind(value);
        self.into_state()
    }
}

impl<'a> FencedUpdate<'a, Keyed> {
    /// Add a further key column for composite keys.
    #[must_use]
    pub fn and_key<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres>,
    {
        self.builder.push(" AND ").push(column).push(" = ").push_bind(value);
        self
    }

    /// Require `token_column` to still hold `expected`.
    pub fn fenced(mut self, token_column: &'static str, expected: FencingToken) -> FencedUpdate<'a, Fenced> {
        self.builder
            .push(" AND ")
            .push(token_column)
            .push(" = ")
            .push_bind(expected.value());
        self.expected = expected;
        self.into_state()
    }
}

impl FencedUpdate<'_, Fenced> {
    /// The statement text with bind placeholders.
    pub fn sql(&self) -> &str {
        self.builder.sql()
    }

    /// The token the write expects.
    pub const fn expected(&self) -> FencingToken {
        self.expected
    }

    /// Run the write and check it matched exactly one row.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::ConditionFailed`] if the token moved,
    /// [`DsqlError::FenceNotUnique`] if the key matched several rows, or
    /// [`DsqlError::Database`] if the statement failed.
    pub async fn execute(mut self, conn: &mut PgConnection) -> Result<(), DsqlError> {
        let rows = self.builder.build().execute(conn).await?.rows_affected();
        check_fence(rows, &self.resource, self.expected)
    }
}

// =============================================================================
// Reads
// =============================================================================

/// Read the current token of one row without locking it.
///
/// # Errors
///
/// Returns [`DsqlError::Database`] if the query fails.
pub async fn read_token(
    conn: &mut PgConnection,
    table: &'static str,
    token_column: &'static str,
    key_column: &'static str,
    key: i64,
) -> Result<Option<FencingToken>, DsqlError> {
    let sql = format!("SELECT {token_column} FROM {table} WHERE {key_column} = $1");
    let token = sqlx::query_scalar::<_, FencingToken>(&sql)
        .bind(key)
        .fetch_optional(conn)
        .await?;
    Ok(token)
}

/// How a read that precedes a write should lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLockMode {
    /// `SELECT ... FOR UPDATE`.
    ForUpdate,
    /// Plain `SELECT`; the fenced write is the only guard.
    Plain,
}

impl ReadLockMode {
    /// The clause to append to the `SELECT`.
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::ForUpdate => " FOR UPDATE",
            Self::Plain => "",
        }
    }
}

/// Per-operation record of which locking reads may be dropped.
///
/// An operation keeps its `FOR UPDATE` unless it was explicitly relaxed
/// with a justification.
#[derive(Debug, Clone, Default)]
pub struct RelaxationAudit {
    relaxed: BTreeMap<&'static str, String>,
}

impl RelaxationAudit {
    /// An audit with nothing relaxed.
    pub fn conservative() -> Self {
        Self::default()
    }

    /// Allow `operation` to read without a lock.
    #[must_use]
    pub fn relax(mut self, operation: &'static str, justification: impl Into<String>) -> Self {
        let justification = justification.into();
        tracing::info!(operation, %justification, "locking read relaxed");
        self.relaxed.insert(operation, justification);
        self
    }

    /// The read mode for `operation`.
    pub fn mode_for(&self, operation: &str) -> ReadLockMode {
        if self.relaxed.contains_key(operation) {
            ReadLockMode::Plain
        } else {
            ReadLockMode::ForUpdate
        }
    }

    /// Relaxed operations and their justifications.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.relaxed.iter().map(|(op, why)| (*op, why.as_str()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn one_row_commits() {
        assert!(check_fence(1, "shard 1", FencingToken::new(6)).is_ok());
    }

    #[test]
    fn zero_rows_is_condition_failure() {
        // Writer read token 5; another actor already moved it to 6.
        let err = check_fence(0, "shard 1", FencingToken::new(5)).unwrap_err();
        assert!(matches!(
            err,
            DsqlError::ConditionFailed { ref resource, expected: 5 } if resource == "shard 1"
        ));
        assert_eq!(dsql_core::Classify::kind(&err), dsql_core::ErrorKind::ConditionFailed);
    }

    #[test]
    fn several_rows_is_not_success() {
        let err = check_fence(2, "shard 1", FencingToken::new(5)).unwrap_err();
        assert!(matches!(err, DsqlError::FenceNotUnique { rows: 2, .. }));
        assert_eq!(dsql_core::Classify::kind(&err), dsql_core::ErrorKind::Permanent);
    }

    #[test]
    fn builder_emits_fenced_update() {
        let update = FencedUpdate::table("shards", "shard 7")
            .set("range_id", 6_i64)
            .set("owner", "host-b")
            .set_expr("updated_at", "NOW()")
            .where_key("shard_id", 7_i64)
            .fenced("range_id", FencingToken::new(5));
        assert_eq!(
            update.sql(),
            "UPDATE shards SET range_id = $1, owner = $2, updated_at = NOW() \
             WHERE shard_id = $3 AND range_id = $4"
        );
        assert_eq!(update.expected(), FencingToken::new(5));
    }

    #[test]
    fn composite_keys() {
        let update = FencedUpdate::table("executions", "execution")
            .set_expr("updated_at", "NOW()")
            .where_key("shard_id", 1_i64)
            .and_key("workflow_id", "wf")
            .fenced("db_version", FencingToken::new(3));
        assert_eq!(
            update.sql(),
            "UPDATE executions SET updated_at = NOW() \
             WHERE shard_id = $1 AND workflow_id = $2 AND db_version = $3"
        );
    }

    #[test]
    fn next_token_is_derived_from_observed() {
        let observed = FencingToken::new(5);
        assert_eq!(observed.next().unwrap().value(), 6);
    }

    #[test]
    fn exhausted_token_is_not_reused() {
        let err = FencingToken::new(i64::MAX).next().unwrap_err();
        assert!(matches!(err, DsqlError::TokenExhausted(i64::MAX)));
        assert_eq!(dsql_core::Classify::kind(&err), dsql_core::ErrorKind::Permanent);
    }

    #[test]
    fn audit_defaults_to_locking() {
        let audit = RelaxationAudit::conservative();
        assert_eq!(audit.mode_for("read_range"), ReadLockMode::ForUpdate);
        assert_eq!(ReadLockMode::ForUpdate.suffix(), " FOR UPDATE");
    }

    #[test]
    fn relaxed_operations_are_recorded() {
        let audit = RelaxationAudit::conservative()
            .relax("read_range", "every write is fenced on range_id");
        assert_eq!(audit.mode_for("read_range"), ReadLockMode::Plain);
        assert_eq!(audit.mode_for("other"), ReadLockMode::ForUpdate);
        let entries: Vec<_> = audit.entries().collect();
        assert_eq!(entries, vec![("read_range", "every write is fenced on range_id")]);
    }
}
