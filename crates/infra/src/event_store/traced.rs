//! Telemetry decorator for any [`EventStore`].
//!
//! Every operation runs inside a span on the `eventflow::eventstore` target;
//! the [`MetricsLayer`](eventflow_observability::MetricsLayer) turns those
//! spans into duration histograms. Results pass through untouched.

use std::future::Future;

use async_trait::async_trait;
use tracing::{Instrument, Span};

use eventflow_core::{
    AppendEventsResult, ExpectedStreamVersion, StreamEvent, StreamName, StreamReadPosition,
    StreamTruncatePosition, TraceContext,
};
use eventflow_observability::telemetry::{EVENT_STORE_TARGET, STORAGE_SYSTEM, spans};

use super::r#trait::{EventStore, EventStoreError};

macro_rules! store_span {
    ($operation:expr, $stream:expr) => {
        tracing::info_span!(
            target: EVENT_STORE_TARGET,
            $operation,
            db.system = STORAGE_SYSTEM,
            db.operation = $operation,
            eventflow.stream = %$stream,
            otel.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
            trace_id = tracing::field::Empty,
        )
    };
}

/// Wraps an event store with spans and trace propagation.
#[derive(Debug, Clone)]
pub struct TracedEventStore<S> {
    inner: S,
}

impl<S> TracedEventStore<S>
where
    S: EventStore,
{
    pub fn trace(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Run `fut` inside `span`, marking the span failed on error.
async fn traced<T, F>(span: Span, fut: F) -> Result<T, EventStoreError>
where
    F: Future<Output = Result<T, EventStoreError>>,
{
    let result = fut.instrument(span.clone()).await;
    if let Err(err) = &result {
        span.record("otel.status_code", "ERROR");
        span.record("error", tracing::field::display(err));
    }
    result
}

#[async_trait]
impl<S> EventStore for TracedEventStore<S>
where
    S: EventStore,
{
    async fn stream_exists(&self, stream: &StreamName) -> Result<bool, EventStoreError> {
        traced(store_span!(spans::STREAM_EXISTS, stream), self.inner.stream_exists(stream)).await
    }

    async fn append_events(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
        events: Vec<StreamEvent>,
    ) -> Result<AppendEventsResult, EventStoreError> {
        let trace = TraceContext::current_or_new();
        let events = events
            .into_iter()
            .map(|event| {
                let metadata = trace.inject(event.metadata());
                event.with_metadata(metadata)
            })
            .collect();

        let span = store_span!(spans::APPEND_EVENTS, stream);
        span.record("trace_id", trace.trace_id.as_str());
        traced(span, self.inner.append_events(stream, expected, events)).await
    }

    async fn read_events(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        traced(
            store_span!(spans::READ_EVENTS, stream),
            self.inner.read_events(stream, start, count),
        )
        .await
    }

    async fn read_events_backwards(
        &self,
        stream: &StreamName,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        traced(
            store_span!(spans::READ_EVENTS_BACKWARDS, stream),
            self.inner.read_events_backwards(stream, count),
        )
        .await
    }

    async fn read_stream(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
        callback: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<u64, EventStoreError> {
        traced(
            store_span!(spans::READ_EVENTS, stream),
            self.inner.read_stream(stream, start, count, callback),
        )
        .await
    }

    async fn truncate_stream(
        &self,
        stream: &StreamName,
        position: StreamTruncatePosition,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        traced(
            store_span!(spans::TRUNCATE_STREAM, stream),
            self.inner.truncate_stream(stream, position, expected),
        )
        .await
    }

    async fn delete_stream(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        traced(
            store_span!(spans::DELETE_STREAM, stream),
            self.inner.delete_stream(stream, expected),
        )
        .await
    }
}
