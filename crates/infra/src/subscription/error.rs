use thiserror::Error;

use eventflow_core::SerializationError;
use eventflow_subscriptions::{CheckpointStoreError, ConsumeError, DropReason};

use crate::event_store::EventStoreError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error("subscription dropped ({reason}): {message}")]
    Dropped { reason: DropReason, message: String },

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    CheckpointStore(#[from] CheckpointStoreError),

    #[error("failed to deserialize '{message_type}' at position {position}: {source}")]
    Deserialization {
        position: u64,
        message_type: String,
        source: SerializationError,
    },

    #[error("message at position {position} failed: {source}")]
    Handler { position: u64, source: ConsumeError },

    #[error("subscription task failed: {0}")]
    Task(String),
}

impl SubscriptionError {
    /// How a failure met while live classifies as a drop.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            SubscriptionError::Dropped { reason, .. } => *reason,
            SubscriptionError::Store(EventStoreError::ConnectionLost(_)) => DropReason::ConnectionLost,
            SubscriptionError::Store(EventStoreError::ServerStopped(_)) => DropReason::ServerStopped,
            _ => DropReason::SubscriberError,
        }
    }
}
