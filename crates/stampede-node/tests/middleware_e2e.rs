//! End-to-end tests for the coalescing middleware.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::future::join_all;
use serde_json::{json, Value};
use stampede_node::config::CoalescingSettings;
use stampede_node::demo;
use stampede_node::middleware::{coalesce_middleware, CoalesceState};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

type Invocations = Arc<AtomicU32>;

async fn echo(State(calls): State<Invocations>, Json(body): Json<Value>) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    Json(json!({ "received": body }))
}

async fn items(State(calls): State<Invocations>) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    Json(json!({ "items": [1, 2, 3] }))
}

async fn chunks(State(calls): State<Invocations>) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    let body = futures::stream::unfold(0u8, |i| async move {
        if i >= 3 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Some((Ok::<_, Infallible>(Bytes::from(format!("chunk {}\n", i))), i + 1))
    });
    Body::from_stream(body).into_response()
}

async fn upload(State(calls): State<Invocations>, body: Bytes) -> String {
    calls.fetch_add(1, Ordering::SeqCst);
    format!("got {} bytes", body.len())
}

async fn unavailable(State(calls): State<Invocations>) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
}

fn create_test_app(settings: CoalescingSettings) -> (Router, Invocations) {
    let calls = Invocations::default();
    let state = CoalesceState::from_settings(&settings);
    state
        .engine()
        .blacklist()
        .exclude(stampede_core::Method::Get, "/blacklisted");

    let app = Router::new()
        .route("/test", post(echo))
        .route("/items", get(items))
        .route("/stream", get(chunks))
        .route("/error", get(unavailable))
        .route("/upload", post(upload))
        .route("/blacklisted", get(items))
        .route("/ws", get(items))
        .with_state(Arc::clone(&calls))
        .layer(axum::middleware::from_fn_with_state(
            state,
            coalesce_middleware,
        ));

    (app, calls)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    let body = payload.to_string();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("content-length", body.len())
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn send_all(app: &Router, requests: Vec<Request<Body>>) -> Vec<Response> {
    join_all(requests.into_iter().map(|request| app.clone().oneshot(request)))
        .await
        .into_iter()
        .map(|response| response.unwrap())
        .collect()
}

#[tokio::test]
async fn test_request_coalescing() {
    let (app, calls) = create_test_app(CoalescingSettings::default());
    let payload = json!({ "test": "data" });

    let requests = (0..3).map(|_| post_json("/test", &payload)).collect();
    let responses = send_all(&app, requests).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "received": payload }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_gets_with_reordered_query() {
    let (app, calls) = create_test_app(CoalescingSettings::default());
    let started = Instant::now();

    let responses = send_all(
        &app,
        vec![
            get_request("/items?sort=asc&limit=10"),
            get_request("/items?limit=10&sort=asc"),
            get_request("/items?sort=asc&limit=10"),
        ],
    )
    .await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "items": [1, 2, 3] }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_different_requests_not_coalesced() {
    let (app, calls) = create_test_app(CoalescingSettings::default());

    let responses = send_all(
        &app,
        vec![
            post_json("/test", &json!({ "test": "data1" })),
            post_json("/test", &json!({ "test": "data2" })),
        ],
    )
    .await;

    let mut bodies = Vec::new();
    for response in responses {
        bodies.push(json_body(response).await);
    }
    assert_eq!(bodies[0]["received"]["test"], "data1");
    assert_eq!(bodies[1]["received"]["test"], "data2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_sequential_requests_each_execute() {
    let (app, calls) = create_test_app(CoalescingSettings::default());

    for _ in 0..2 {
        let response = app.clone().oneshot(get_request("/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_bytes(response).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_streaming_response() {
    let (app, _) = create_test_app(CoalescingSettings::default());

    let response = app.clone().oneshot(get_request("/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"chunk 0\nchunk 1\nchunk 2\n");
}

#[tokio::test]
async fn test_streaming_response_shared() {
    let (app, calls) = create_test_app(CoalescingSettings::default());

    let responses = send_all(&app, (0..3).map(|_| get_request("/stream")).collect()).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], b"chunk 0\nchunk 1\nchunk 2\n");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blacklisted_endpoint() {
    let (app, calls) = create_test_app(CoalescingSettings::default());

    let responses = send_all(&app, (0..3).map(|_| get_request("/blacklisted")).collect()).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_error_status_shared_verbatim() {
    let (app, calls) = create_test_app(CoalescingSettings::default());

    let responses = send_all(&app, (0..3).map(|_| get_request("/error")).collect()).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&body_bytes(response).await[..], b"unavailable");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_websocket_upgrade_bypasses() {
    let (app, calls) = create_test_app(CoalescingSettings::default());

    let upgrade = || {
        Request::builder()
            .method("GET")
            .uri("/ws")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap()
    };

    let responses = send_all(&app, vec![upgrade(), upgrade()]).await;
    assert_eq!(responses.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disabled_coalescing() {
    let settings = CoalescingSettings {
        enabled: false,
        ..Default::default()
    };
    let (app, calls) = create_test_app(settings);

    send_all(&app, (0..3).map(|_| get_request("/items")).collect()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_oversized_body_executes_directly() {
    let settings = CoalescingSettings {
        max_body_bytes: 16,
        ..Default::default()
    };
    let (app, calls) = create_test_app(settings);
    let payload = json!({ "test": "a payload well past sixteen bytes" });

    let responses = send_all(
        &app,
        vec![post_json("/test", &payload), post_json("/test", &payload)],
    )
    .await;

    for response in responses {
        assert_eq!(json_body(response).await, json!({ "received": payload }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_oversized_chunked_body_reaches_handler_whole() {
    let settings = CoalescingSettings {
        max_body_bytes: 16,
        ..Default::default()
    };
    let (app, calls) = create_test_app(settings);

    let frames = vec![
        Ok::<_, Infallible>(Bytes::from(vec![b'a'; 20])),
        Ok(Bytes::from(vec![b'b'; 20])),
    ];
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .body(Body::from_stream(futures::stream::iter(frames)))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"got 40 bytes");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_demo_router_request_ids_and_metrics() {
    let state = CoalesceState::from_settings(&CoalescingSettings::default());
    let app = demo::router(state);

    let responses = send_all(
        &app,
        vec![
            get_request("/items?sort=asc&limit=10"),
            get_request("/items?limit=10&sort=asc"),
        ],
    )
    .await;

    let ids: Vec<_> = responses
        .iter()
        .map(|response| response.headers()["x-request-id"].clone())
        .collect();
    assert_ne!(ids[0], ids[1]);

    let mut bodies = Vec::new();
    for response in responses {
        bodies.push(json_body(response).await);
    }
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[0]["items"], json!([1, 2, 3]));

    let health = app.clone().oneshot(get_request("/health")).await.unwrap();
    assert_eq!(json_body(health).await, json!({ "status": "ok" }));

    let metrics = app.clone().oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(metrics).await.to_vec()).unwrap();
    assert!(text.contains("stampede_requests_total"));
    assert!(text.contains("stampede_handler_invocations_total"));
}
