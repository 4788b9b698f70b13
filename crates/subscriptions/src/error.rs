use thiserror::Error;

/// Failure recorded against a single message.
///
/// These never abort the pipe for other messages; whether a failure stops
/// the subscription is decided by the engine's policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    #[error("failed to deserialize '{message_type}': {reason}")]
    Deserialization { message_type: String, reason: String },

    #[error("handler '{handler}' failed on '{message_type}': {reason}")]
    Handler {
        handler: String,
        message_type: String,
        reason: String,
    },

    #[error("no handler registered for message type '{0}'")]
    UnknownMessageType(String),

    #[error("partition lane {0} is closed")]
    LaneClosed(usize),

    #[error("message processing cancelled")]
    Cancelled,
}

impl ConsumeError {
    pub fn handler(handler: impl Into<String>, message_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message_type: message_type.into(),
            reason: reason.into(),
        }
    }
}
