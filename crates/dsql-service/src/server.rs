//! Metrics HTTP endpoint.
//!
//! Serves the Prometheus text exposition of the shared registry at
//! `GET /metrics` and a liveness probe at `GET /health`.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dsql_core::Metrics;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ServiceError;

/// Content type of the Prometheus text format.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Build the metrics router.
pub fn build_router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Metrics>) -> Response {
    match metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Serve `router` on `listen_addr` until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns [`ServiceError::Bind`] if the address is invalid or cannot be
/// bound, or [`ServiceError::Serve`] on a fatal I/O error.
pub async fn serve(
    listen_addr: &str,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| ServiceError::Bind(format!("invalid address {listen_addr}: {e}")))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServiceError::Bind(format!("bind failed on {addr}: {e}")))?;

    info!(%addr, "metrics server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| ServiceError::Serve(e.to_string()))?;

    info!("metrics server stopped");
    Ok(())
}
