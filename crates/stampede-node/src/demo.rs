//! Demo routes served by the `stampede-node` binary.
//!
//! Slow endpoints make coalescing observable from the outside: fire a few
//! identical requests at `/items` and `stampede_handler_invocations_total`
//! goes up by one.

use crate::middleware::{coalesce_middleware, CoalesceState};
use crate::observability::{metrics_handler, request_id_middleware};
use axum::{
    body::Body,
    extract::Query,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use serde_json::{json, Value};
use stampede_core::Method;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Simulated handler latency.
const WORK_DELAY: Duration = Duration::from_millis(100);

/// Builds the demo router.
///
/// Everything except `/health` and `/metrics` runs behind the coalescing
/// middleware. `/blacklisted` is registered as exempt at startup.
pub fn router(state: CoalesceState) -> Router {
    state
        .engine()
        .blacklist()
        .exclude(Method::Get, "/blacklisted");

    let coalesced = Router::new()
        .route("/items", get(list_items))
        .route("/stream", get(stream_chunks))
        .route("/echo", post(echo))
        .route("/blacklisted", get(blacklisted))
        .layer(axum::middleware::from_fn_with_state(
            state,
            coalesce_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .merge(coalesced)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_items(Query(params): Query<BTreeMap<String, String>>) -> Json<Value> {
    tokio::time::sleep(WORK_DELAY).await;
    Json(json!({ "items": [1, 2, 3], "query": params }))
}

async fn stream_chunks() -> Response {
    let chunks = stream::unfold(0u8, |i| async move {
        if i >= 3 {
            return None;
        }
        tokio::time::sleep(WORK_DELAY).await;
        Some((Ok::<_, Infallible>(Bytes::from(format!("chunk {}\n", i))), i + 1))
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    tokio::time::sleep(WORK_DELAY).await;
    Json(json!({ "received": body }))
}

async fn blacklisted() -> Json<Value> {
    tokio::time::sleep(WORK_DELAY).await;
    Json(json!({ "status": "not_coalesced" }))
}
