//! Schema setup.
//!
//! The backend accepts one DDL statement per transaction and never mixes
//! DDL with DML, and it has no advisory locks. Schema files are therefore
//! split into statements and each is run on its own in autocommit mode.
//! Every bundled statement is idempotent (`IF NOT EXISTS`), so applying the
//! schema again is a no-op and no applied-version table is kept.

use sqlx::PgConnection;

use crate::error::DsqlError;

/// DDL for the `shards` table.
pub const SHARDS_SCHEMA: &str = include_str!("../schema/shards.sql");

/// Every bundled schema file, in application order.
pub const BUNDLED_SCHEMA: &[(&str, &str)] = &[("shards", SHARDS_SCHEMA)];

/// Split a schema file into statements.
///
/// Lines starting with `--` and blank lines are dropped before splitting on
/// `;`. Semicolons inside string literals are not supported.
pub fn split_statements(sql: &str) -> Vec<String> {
    let clean = sql
        .lines()
        .filter(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with("--")
        })
        .collect::<Vec<_>>()
        .join("\n");
    clean
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The first few words of a statement, for logs.
fn summary(stmt: &str) -> String {
    stmt.split_whitespace().take(6).collect::<Vec<_>>().join(" ")
}

/// Run every statement of `sql`, each outside any explicit transaction.
/// Returns the number of statements run.
///
/// # Errors
///
/// Returns [`DsqlError::Schema`] naming the first statement that failed.
/// Statements before it stay applied.
pub async fn apply_schema(conn: &mut PgConnection, name: &str, sql: &str) -> Result<usize, DsqlError> {
    let statements = split_statements(sql);
    for stmt in &statements {
        let summary = summary(stmt);
        sqlx::raw_sql(stmt)
            .execute(&mut *conn)
            .await
            .map_err(|source| DsqlError::Schema {
                statement: summary.clone(),
                source,
            })?;
        tracing::info!(schema = name, statement = %summary, "schema statement applied");
    }
    Ok(statements.len())
}

/// Apply every bundled schema file.
///
/// # Errors
///
/// Returns [`DsqlError::Schema`] if a statement fails.
pub async fn run_migrations(conn: &mut PgConnection) -> Result<(), DsqlError> {
    let mut applied = 0_usize;
    for (name, sql) in BUNDLED_SCHEMA {
        applied = applied.saturating_add(apply_schema(conn, name, sql).await?);
    }
    tracing::info!(statements = applied, "schema up to date");
    Ok(())
}
