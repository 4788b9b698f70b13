use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use eventflow_core::{
    AppendEventsResult, ExpectedStreamVersion, StreamEvent, StreamName, StreamReadPosition,
    StreamTruncatePosition,
};

/// Page size used by the default `read_stream`.
pub const READ_STREAM_PAGE_SIZE: usize = 500;

/// Event store operation error.
///
/// `ConcurrencyConflict` and `StreamNotFound` are outcomes of a healthy store.
/// `ConnectionLost` and `ServerStopped` describe the transport and drive drop
/// classification in subscriptions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("concurrency conflict on '{stream}': expected {expected}, actual {}", display_version(.actual))]
    ConcurrencyConflict {
        stream: StreamName,
        expected: ExpectedStreamVersion,
        actual: Option<u64>,
    },

    #[error("stream '{0}' not found")]
    StreamNotFound(StreamName),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("server stopped: {0}")]
    ServerStopped(String),

    #[error("storage error: {0}")]
    Storage(String),
}

fn display_version(version: &Option<u64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "no stream".to_string(),
    }
}

impl EventStoreError {
    /// Whether the error means the store itself became unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EventStoreError::ConnectionLost(_) | EventStoreError::ServerStopped(_)
        )
    }
}

/// Append-only, per-stream ordered event log with optimistic concurrency.
///
/// ## Append semantics
///
/// Appends to one stream behave as a compare-and-swap on the stream version:
/// the batch is persisted atomically iff `expected` matches the current
/// version, otherwise nothing changes and `ConcurrencyConflict` is returned.
/// Positions are 0-based, so a stream holding n events is at version n-1.
/// Operations on different streams are independent.
///
/// ## Read semantics
///
/// Reads never return events below the stream's truncate mark and fail with
/// `StreamNotFound` if the stream does not exist.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn stream_exists(&self, stream: &StreamName) -> Result<bool, EventStoreError>;

    /// Append `events` if the stream version matches `expected`.
    async fn append_events(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
        events: Vec<StreamEvent>,
    ) -> Result<AppendEventsResult, EventStoreError>;

    /// Up to `count` events from `start`, in stream order.
    async fn read_events(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError>;

    /// The last `count` events, newest first.
    async fn read_events_backwards(
        &self,
        stream: &StreamName,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError>;

    /// Visit up to `count` events from `start` without buffering them all.
    /// Returns the number of events visited.
    async fn read_stream(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
        callback: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<u64, EventStoreError> {
        let mut position = start;
        let mut visited = 0u64;
        let mut remaining = count;

        while remaining > 0 {
            let page = self
                .read_events(stream, position, remaining.min(READ_STREAM_PAGE_SIZE))
                .await?;
            let Some(last) = page.last().and_then(StreamEvent::position) else {
                break;
            };
            let read = page.len();
            for event in page {
                callback(event);
            }
            visited += read as u64;
            remaining -= read;
            position = StreamReadPosition(last + 1);
        }

        Ok(visited)
    }

    /// Hide events below `position`. The stream version does not change.
    async fn truncate_stream(
        &self,
        stream: &StreamName,
        position: StreamTruncatePosition,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError>;

    /// Remove the stream. A later `NoStream` append starts it over at 0.
    async fn delete_stream(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn stream_exists(&self, stream: &StreamName) -> Result<bool, EventStoreError> {
        (**self).stream_exists(stream).await
    }

    async fn append_events(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
        events: Vec<StreamEvent>,
    ) -> Result<AppendEventsResult, EventStoreError> {
        (**self).append_events(stream, expected, events).await
    }

    async fn read_events(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        (**self).read_events(stream, start, count).await
    }

    async fn read_events_backwards(
        &self,
        stream: &StreamName,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        (**self).read_events_backwards(stream, count).await
    }

    async fn read_stream(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
        callback: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<u64, EventStoreError> {
        (**self).read_stream(stream, start, count, callback).await
    }

    async fn truncate_stream(
        &self,
        stream: &StreamName,
        position: StreamTruncatePosition,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        (**self).truncate_stream(stream, position, expected).await
    }

    async fn delete_stream(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        (**self).delete_stream(stream, expected).await
    }
}
