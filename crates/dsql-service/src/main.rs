//! DSQL compatibility layer service entry point.
//!
//! Loads `dsql-config.yaml` (or the path given as the first argument, or
//! `DSQL_CONFIG`), starts the connection reservoir, pool, and lease renewal,
//! verifies connectivity, and serves Prometheus metrics until `Ctrl-C`.
//!
//! Pass `--migrate` to run the bundled schema migrations at startup.

use std::path::PathBuf;

use anyhow::Context;
use dsql_core::{DsqlConfig, Metrics};
use dsql_service::Service;
use dsql_service::server::{build_router, serve};
use dsql_service::startup::init_tracing;
use tracing::info;

/// Default configuration file name.
const DEFAULT_CONFIG: &str = "dsql-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, startup, or the metrics server fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut migrate = false;
    let mut config_arg = None;
    for arg in std::env::args().skip(1) {
        if arg == "--migrate" {
            migrate = true;
        } else {
            config_arg = Some(PathBuf::from(arg));
        }
    }
    let config_path = config_arg
        .or_else(|| std::env::var_os("DSQL_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = if config_path.exists() {
        DsqlConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        DsqlConfig::parse("").context("building default configuration")?
    };

    init_tracing(&config.logging);
    info!(config = %config_path.display(), "dsql-service starting");

    let metrics = Metrics::new().context("registering metrics")?;
    let service = Service::start(&config, metrics.clone(), migrate)
        .await
        .context("starting data layer")?;

    let server = if config.metrics.enabled {
        let router = build_router(metrics);
        let listen_addr = config.metrics.listen_addr.clone();
        let shutdown = service.shutdown_signal();
        Some(tokio::spawn(async move { serve(&listen_addr, router, shutdown).await }))
    } else {
        None
    };

    info!("dsql-service ready");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    service.shutdown().await;
    if let Some(server) = server {
        server.await.context("metrics server task")??;
    }
    Ok(())
}
