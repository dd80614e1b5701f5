//! Tests for the metrics endpoint.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server.

#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dsql_core::Metrics;
use dsql_service::server::build_router;
use tower::ServiceExt;

async fn body_text(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn metrics_endpoint_serves_text_exposition() {
    let metrics = Metrics::new().unwrap();
    metrics.set_reservoir_target(50);
    metrics.record_discard("guard_window");
    let router = build_router(metrics);

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(content_type.starts_with("text/plain"));
    let text = body_text(response.into_body()).await;
    assert!(text.contains("dsql_reservoir_target 50"));
    assert!(text.contains("dsql_reservoir_discards_total{reason=\"guard_window\"} 1"));
}

#[tokio::test]
async fn health_endpoint_is_ok() {
    let router = build_router(Metrics::new().unwrap());
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response.into_body()).await, "ok");
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let router = build_router(Metrics::new().unwrap());
    let response = router
        .oneshot(Request::get("/api").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
