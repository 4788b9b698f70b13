//! Primitive-level error model.

use thiserror::Error;

/// Result type used by the primitive constructors.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while constructing core values.
///
/// Storage, subscription and serialization failures have their own error
/// types closer to the boundary that produces them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A stream name was empty or whitespace.
    #[error("invalid stream name: {0}")]
    InvalidStreamName(String),
}

impl CoreError {
    pub fn invalid_stream_name(msg: impl Into<String>) -> Self {
        Self::InvalidStreamName(msg.into())
    }
}
