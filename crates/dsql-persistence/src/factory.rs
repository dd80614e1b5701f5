//! Opening single authenticated backend connections.
//!
//! [`PgConnectionFactory`] is the only component that dials the backend.
//! Every call to [`ConnectionFactory::connect`] mints a fresh credential,
//! connects over TLS, and pins the session's `search_path`.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsql_core::config::ConnectionConfig;
use dsql_core::Metrics;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection};
use tokio::time::Instant;

use crate::error::DsqlError;
use crate::token::TokenProvider;

/// Creates physical connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + Debug + 'static {
    /// The connection type produced.
    type Connection: Send + 'static;

    /// Open one new connection.
    async fn connect(&self) -> Result<Self::Connection, DsqlError>;

    /// Close a connection gracefully.
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Opens `sqlx` `PostgreSQL` connections against a DSQL cluster.
#[derive(Debug)]
pub struct PgConnectionFactory {
    options: PgConnectOptions,
    tokens: Arc<dyn TokenProvider>,
    search_path: String,
    connect_timeout: Duration,
    metrics: Option<Metrics>,
}

impl PgConnectionFactory {
    /// Build a factory from the `connection` config section.
    ///
    /// The admin user always uses the `public` schema; other users use
    /// `connection.schema`.
    pub fn from_config(config: &ConnectionConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        let ssl_mode = if config.require_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        let options = PgConnectOptions::new()
            .host(&config.endpoint)
            .port(config.port)
            .username(&config.user)
            .database(&config.database)
            .ssl_mode(ssl_mode)
            .application_name("dsql-compat");
        let search_path = if config.is_admin() {
            "public".to_owned()
        } else {
            config.schema.clone()
        };
        Self {
            options,
            tokens,
            search_path,
            connect_timeout: config.connect_timeout(),
            metrics: None,
        }
    }

    /// Attach a metrics handle.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The schema every new session is pinned to.
    pub fn search_path(&self) -> &str {
        &self.search_path
    }
}

/// `SET search_path` statement for `schema`, quoted as an identifier.
pub fn search_path_statement(schema: &str) -> String {
    format!("SET search_path TO \"{}\"", schema.replace('"', "\"\""))
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, DsqlError> {
        let started = Instant::now();
        let token = self.tokens.token().await?;
        let options = self.options.clone().password(&token);

        let search_path = search_path_statement(&self.search_path);
        let setup = async {
            let mut conn = PgConnection::connect_with(&options).await?;
            sqlx::query(&search_path).execute(&mut conn).await?;
            Ok::<_, DsqlError>(conn)
        };
        // Covers the handshake and the session setup round trip.
        let conn = tokio::time::timeout(self.connect_timeout, setup)
            .await
            .map_err(|_elapsed| DsqlError::ConnectTimeout(self.connect_timeout))??;

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_connect_duration(elapsed);
        }
        tracing::debug!(
            elapsed_ms = elapsed.as_millis(),
            search_path = %self.search_path,
            "backend connection established"
        );
        Ok(conn)
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "error closing backend connection");
        }
    }
}

/// Ping the backend and read its clock.
///
/// Used as the startup connectivity check.
///
/// # Errors
///
/// Returns [`DsqlError::Database`] if either round trip fails.
pub async fn check_connectivity(conn: &mut PgConnection) -> Result<DateTime<Utc>, DsqlError> {
    conn.ping().await?;
    let (now,): (DateTime<Utc>,) = sqlx::query_as("SELECT NOW()")
        .fetch_one(&mut *conn)
        .await?;
    Ok(now)
}
