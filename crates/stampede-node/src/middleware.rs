//! Axum middleware that routes requests through the coalescing engine.
//!
//! The rest of the stack (`next.run`) is the opaque handler invocation.
//! Responses with a known, small length are buffered and shared as one
//! value; anything else is shared chunk by chunk.

use crate::config::CoalescingSettings;
use crate::error::BodyError;
use crate::observability::METRICS;
use axum::{
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode, Version},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt, TryStreamExt};
use stampede_core::{
    CoalesceError, CoalescingEngine, HandlerOutput, Method, Reply, RequestBody, RequestDescriptor,
};
use std::time::Instant;

/// The engine specialized for HTTP responses.
pub type HttpEngine = CoalescingEngine<SharedResponse, BodyError>;

/// A response as shared between coalesced callers.
///
/// For streamed responses `body` is empty and the chunks travel separately.
#[derive(Debug, Clone)]
pub struct SharedResponse {
    /// Response status.
    pub status: StatusCode,
    /// HTTP version.
    pub version: Version,
    /// Response headers.
    pub headers: HeaderMap,
    /// Buffered body.
    pub body: Bytes,
}

impl SharedResponse {
    fn into_response_with(self, body: Body) -> Response {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers;
        response
    }
}

/// State for [`coalesce_middleware`].
#[derive(Clone, Debug)]
pub struct CoalesceState {
    engine: HttpEngine,
    max_body_bytes: usize,
    max_buffered_response_bytes: usize,
}

impl CoalesceState {
    /// Wraps an existing engine with the body limits from `settings`.
    pub fn new(engine: HttpEngine, settings: &CoalescingSettings) -> Self {
        Self {
            engine,
            max_body_bytes: settings.max_body_bytes,
            max_buffered_response_bytes: settings.max_buffered_response_bytes,
        }
    }

    /// Builds the engine and blacklist from `settings`.
    pub fn from_settings(settings: &CoalescingSettings) -> Self {
        let engine = HttpEngine::builder()
            .config(settings.engine_config())
            .blacklist(settings.blacklist())
            .build();
        Self::new(engine, settings)
    }

    /// The underlying engine.
    pub fn engine(&self) -> &HttpEngine {
        &self.engine
    }
}

/// Coalescing middleware, installed with
/// `axum::middleware::from_fn_with_state(state, coalesce_middleware)`.
pub async fn coalesce_middleware(
    State(state): State<CoalesceState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();

    let (descriptor, request) = describe(request, state.max_body_bytes).await;
    let Some(descriptor) = descriptor else {
        tracing::debug!(method = %request.method(), "Unsupported method token, executing directly");
        METRICS.record_invocation();
        let execution = METRICS.track_execution();
        let response = next.run(request).await;
        drop(execution);
        METRICS.record_request("bypass", started.elapsed().as_secs_f64());
        return response;
    };

    let limit = state.max_buffered_response_bytes;
    let handled = state
        .engine
        .dispatch(&descriptor, move || {
            METRICS.record_invocation();
            let execution = METRICS.track_execution();
            let response = next.run(request);
            async move {
                let output = into_output(response.await, limit).await;
                drop(execution);
                output
            }
        })
        .await;

    METRICS.record_request(handled.role.as_str(), started.elapsed().as_secs_f64());

    into_http(handled.result)
}

/// Builds the descriptor for `request` and returns the request to forward.
///
/// The descriptor is `None` when the method cannot be represented.
async fn describe(
    request: Request,
    max_body_bytes: usize,
) -> (Option<RequestDescriptor>, Request) {
    let (parts, body) = request.into_parts();
    let Ok(method) = parts.method.as_str().parse::<Method>() else {
        return (None, Request::from_parts(parts, body));
    };

    let upgrade = is_upgrade(&parts.headers);
    let carries_body = method.carries_body();
    let descriptor = RequestDescriptor::new(method, parts.uri.path())
        .with_query(parse_query(parts.uri.query()))
        .upgrade(upgrade);

    if upgrade || !carries_body {
        return (Some(descriptor), Request::from_parts(parts, body));
    }

    if let Some(length) = declared_length(&parts.headers).filter(|len| *len > max_body_bytes) {
        let reason = format!("declared length {} exceeds {} bytes", length, max_body_bytes);
        return (
            Some(descriptor.with_body(RequestBody::Unreadable(reason))),
            Request::from_parts(parts, body),
        );
    }

    match buffer_body(body, max_body_bytes).await {
        Ok(bytes) => (
            Some(descriptor.with_body(bytes.clone())),
            Request::from_parts(parts, Body::from(bytes)),
        ),
        Err((reason, body)) => {
            tracing::warn!(
                path = %parts.uri.path(),
                reason = %reason,
                "Request body not fingerprinted"
            );
            (
                Some(descriptor.with_body(RequestBody::Unreadable(reason))),
                Request::from_parts(parts, body),
            )
        }
    }
}

/// Reads `body` into memory if it fits in `limit` bytes.
///
/// Past the limit, or on a read error, the body is handed back whole: the
/// frames read so far followed by the unread remainder.
async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, (String, Body)> {
    let mut stream = body.into_data_stream();
    let mut frames: Vec<Result<Bytes, axum::Error>> = Vec::new();
    let mut read = 0usize;

    let reason = loop {
        match stream.next().await {
            None => {
                let mut buffer = BytesMut::with_capacity(read);
                for frame in frames.into_iter().flatten() {
                    buffer.extend_from_slice(&frame);
                }
                return Ok(buffer.freeze());
            }
            Some(Ok(frame)) => {
                read += frame.len();
                frames.push(Ok(frame));
                if read > limit {
                    break format!("body exceeds {} bytes", limit);
                }
            }
            Some(Err(error)) => {
                let reason = error.to_string();
                frames.push(Err(error));
                break reason;
            }
        }
    };

    let body = Body::from_stream(stream::iter(frames).chain(stream));
    Err((reason, body))
}

/// True for protocol upgrade requests such as WebSocket handshakes.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers.get(header::UPGRADE);
    let websocket = upgrade
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("websocket"));

    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    websocket || (connection_upgrade && upgrade.is_some())
}

/// Splits a raw query string into pairs, in order, without decoding.
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn into_output(
    response: Response,
    limit: usize,
) -> Result<HandlerOutput<SharedResponse, BodyError>, BodyError> {
    let (parts, body) = response.into_parts();
    let head = SharedResponse {
        status: parts.status,
        version: parts.version,
        headers: parts.headers,
        body: Bytes::new(),
    };

    match body.size_hint().exact() {
        Some(length) if length <= limit as u64 => {
            let body = axum::body::to_bytes(body, usize::MAX).await?;
            Ok(HandlerOutput::Value(SharedResponse { body, ..head }))
        }
        _ => Ok(HandlerOutput::stream(
            head,
            body.into_data_stream().map_err(BodyError::from),
        )),
    }
}

fn into_http(
    result: Result<Reply<SharedResponse, BodyError>, CoalesceError<BodyError>>,
) -> Response {
    match result {
        Ok(Reply::Value(mut shared)) => {
            let body = Body::from(std::mem::take(&mut shared.body));
            shared.into_response_with(body)
        }
        Ok(Reply::Stream { head, chunks }) => head.into_response_with(Body::from_stream(chunks)),
        Err(error) => {
            tracing::error!(error = %error, "Coalesced request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "detail": error.to_string() })),
            )
                .into_response()
        }
    }
}
