//! Error types for the coalescing engine.

use thiserror::Error;

/// Errors raised while deriving a dedup key from a request.
///
/// These never reach the caller of the engine: a request that cannot be
/// fingerprinted is executed directly without coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    /// The transport could not read the request body.
    #[error("unreadable request body: {0}")]
    UnreadableBody(String),

    /// The request path is empty, relative, or contains a NUL byte.
    #[error("invalid request path: {0:?}")]
    InvalidPath(String),
}

/// Errors delivered to callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError<E> {
    /// The handler invocation failed. Every attached caller sees the same value.
    #[error("handler failed: {0}")]
    Handler(E),

    /// The leader stopped before publishing a terminal result.
    #[error("leader stopped before publishing a result")]
    LeaderLost,
}

impl<E> CoalesceError<E> {
    /// Returns the handler error, if this is one.
    pub fn handler_error(&self) -> Option<&E> {
        match self {
            CoalesceError::Handler(e) => Some(e),
            CoalesceError::LeaderLost => None,
        }
    }
}

/// A breach of the ticket publishing protocol.
///
/// This indicates a bug in the caller driving a [`LeaderHandle`](crate::LeaderHandle),
/// not a request-level failure. The offending publish is rejected and nothing
/// is delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// A terminal result was already published.
    #[error("ticket already completed")]
    AlreadyCompleted,

    /// A chunk or end marker was published before the stream head.
    #[error("stream not started")]
    StreamNotStarted,

    /// A second stream head, or a single value, was published mid-stream.
    #[error("stream already started")]
    StreamAlreadyStarted,
}
