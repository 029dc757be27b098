//! # Observability
//!
//! Logging and metrics for the coalescing node:
//!
//! - **Structured Logging**: pretty or JSON output through `tracing-subscriber`
//! - **Prometheus Metrics**: requests by coalescing role, handler invocations
//!   and in-flight executions
//! - **Request IDs**: an `x-request-id` header on every response, including
//!   responses shared between coalesced callers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::Router;
//! use stampede_node::observability::{init_logging, request_id_middleware, LogFormat};
//!
//! init_logging("info", LogFormat::Json);
//!
//! let app: Router<()> = Router::new()
//!     .layer(axum::middleware::from_fn(request_id_middleware));
//! ```

mod logging;
mod metrics;
mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::{ExecutionGuard, MetricsState, RoleLabels, METRICS};
pub use middleware::{metrics_handler, request_id_middleware, RequestId, REQUEST_ID_HEADER};
