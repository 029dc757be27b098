//! Error types for the node.

use std::sync::Arc;
use thiserror::Error;

/// Errors raised while configuring or running the node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure while reading a handler's response body.
///
/// Shared with every caller attached to the same execution, so it only
/// carries the rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("response body failed: {0}")]
pub struct BodyError(Arc<str>);

impl BodyError {
    /// Creates a body error from any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string().into())
    }
}

impl From<axum::Error> for BodyError {
    fn from(error: axum::Error) -> Self {
        Self::new(error)
    }
}
