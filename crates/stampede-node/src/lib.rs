//! # Stampede Node
//!
//! HTTP integration for the [`stampede_core`] coalescing engine.
//!
//! ```text
//! request ─► request_id ─► coalesce_middleware ─► route handler
//!                                 │
//!                    RequestDescriptor + next.run()
//!                                 │
//!                         CoalescingEngine
//! ```
//!
//! ## Modules
//!
//! - [`middleware`] - Axum middleware and the shared response type
//! - [`config`] - Layered node configuration
//! - [`observability`] - Logging, Prometheus metrics, request IDs
//! - [`demo`] - Demo routes for the `stampede-node` binary
//!
//! ## Usage
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use stampede_node::config::CoalescingSettings;
//! use stampede_node::middleware::{coalesce_middleware, CoalesceState};
//!
//! let state = CoalesceState::from_settings(&CoalescingSettings::default());
//! let app: Router = Router::new()
//!     .route("/items", get(|| async { "items" }))
//!     .layer(axum::middleware::from_fn_with_state(state, coalesce_middleware));
//! ```

pub mod config;
pub mod demo;
pub mod error;
pub mod middleware;
pub mod observability;

pub use config::{BlacklistEntry, CoalescingSettings, NodeConfig};
pub use error::{BodyError, NodeError};
pub use middleware::{coalesce_middleware, CoalesceState, HttpEngine, SharedResponse};
