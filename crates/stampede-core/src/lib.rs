//! # Stampede Core
//!
//! Request coalescing for concurrent, semantically identical requests.
//!
//! When several identical requests arrive while one of them is already being
//! handled, only the first (the *leader*) runs the handler. The others
//! (*followers*) attach to the leader's in-flight execution and receive the
//! same result, including streamed bodies, which are replayed chunk by chunk
//! to every follower.
//!
//! This is a stampede-prevention primitive, not a cache: once an execution
//! completes, the next identical request runs the handler again.
//!
//! ## Components
//!
//! - [`Fingerprinter`] / [`Sha256Fingerprinter`]: request → [`DedupKey`]
//! - [`Blacklist`] / [`SharedBlacklist`]: routes that are never coalesced
//! - [`Ticket`]: one in-flight execution and its published result
//! - [`CoalescingRegistry`]: atomic leader election per key
//! - [`CoalescingEngine`]: the entry point used by the transport layer
//!
//! ## Example
//!
//! ```
//! use stampede_core::{
//!     Blacklist, CoalescingEngine, HandlerOutput, Method, RequestDescriptor, Role,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = CoalescingEngine::<u16, String>::builder()
//!     .blacklist(Blacklist::builder().exclude(Method::Post, "/payments").build())
//!     .build();
//!
//! let request = RequestDescriptor::new(Method::Get, "/items")
//!     .with_query([("sort", "asc"), ("limit", "10")]);
//!
//! let handled = engine
//!     .dispatch(&request, || async { Ok(HandlerOutput::Value(200)) })
//!     .await;
//!
//! assert_eq!(handled.role, Role::Leader);
//! # }
//! ```

mod blacklist;
mod engine;
mod error;
mod fingerprint;
mod registry;
mod reply;
mod request;
mod stats;
mod ticket;

pub use blacklist::{Blacklist, BlacklistBuilder, SharedBlacklist};
pub use engine::{CoalescingEngine, EngineBuilder, EngineConfig, Handled, Role};
pub use error::{CoalesceError, ContractViolation, FingerprintError};
pub use fingerprint::{DedupKey, Fingerprinter, Sha256Fingerprinter};
pub use registry::{
    Acquired, BypassReason, CoalescingRegistry, LeaderHandle, RegistryConfig, StreamAttachPolicy,
};
pub use reply::{ChunkStream, HandlerOutput, Reply};
pub use request::{normalize_path, InvalidMethod, Method, RequestBody, RequestDescriptor};
pub use stats::CoalescerStats;
pub use ticket::{Subscriber, Ticket, TicketState};
