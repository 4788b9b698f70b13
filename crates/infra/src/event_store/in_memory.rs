use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use eventflow_core::{
    AppendEventsResult, ExpectedStreamVersion, StreamEvent, StreamName, StreamReadPosition,
    StreamTruncatePosition,
};

use super::r#trait::{EventStore, EventStoreError};

#[derive(Debug, Default)]
struct StreamState {
    events: Vec<StreamEvent>,
    truncate_before: u64,
}

impl StreamState {
    fn version(&self) -> Option<u64> {
        self.events.last().and_then(StreamEvent::position)
    }

    fn visible_from(&self, start: u64) -> impl DoubleEndedIterator<Item = &StreamEvent> {
        let from = start.max(self.truncate_before) as usize;
        self.events.iter().skip(from)
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<StreamName, StreamState>,
    next_global: u64,
}

/// In-memory event store.
///
/// Intended for tests/dev. A single lock makes every append a linearizable
/// compare-and-swap.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of `stream`, `None` if it does not exist.
    pub fn stream_version(&self, stream: &StreamName) -> Option<u64> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.streams.get(stream).and_then(StreamState::version))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, EventStoreError> {
        self.inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, EventStoreError> {
        self.inner
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }
}

fn check_expected(
    stream: &StreamName,
    expected: ExpectedStreamVersion,
    current: Option<u64>,
) -> Result<(), EventStoreError> {
    if expected.matches(current) {
        Ok(())
    } else {
        Err(EventStoreError::ConcurrencyConflict {
            stream: stream.clone(),
            expected,
            actual: current,
        })
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn stream_exists(&self, stream: &StreamName) -> Result<bool, EventStoreError> {
        Ok(self.read()?.streams.contains_key(stream))
    }

    async fn append_events(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
        events: Vec<StreamEvent>,
    ) -> Result<AppendEventsResult, EventStoreError> {
        if events.is_empty() {
            return Err(EventStoreError::InvalidAppend(format!(
                "empty batch for stream '{stream}'"
            )));
        }

        let mut inner = self.write()?;
        let current = inner.streams.get(stream).and_then(StreamState::version);
        check_expected(stream, expected, current)?;

        let mut global = inner.next_global;
        let mut position = current.map_or(0, |v| v + 1);
        let state = inner.streams.entry(stream.clone()).or_default();
        for event in events {
            state.events.push(event.with_positions(position, global));
            position += 1;
            global += 1;
        }
        inner.next_global = global;

        Ok(AppendEventsResult {
            next_expected_version: position - 1,
            global_position: global - 1,
        })
    }

    async fn read_events(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        let inner = self.read()?;
        let state = inner
            .streams
            .get(stream)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;

        Ok(state.visible_from(start.value()).take(count).cloned().collect())
    }

    async fn read_events_backwards(
        &self,
        stream: &StreamName,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        let inner = self.read()?;
        let state = inner
            .streams
            .get(stream)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;

        Ok(state.visible_from(0).rev().take(count).cloned().collect())
    }

    async fn truncate_stream(
        &self,
        stream: &StreamName,
        position: StreamTruncatePosition,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        let mut inner = self.write()?;
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;
        check_expected(stream, expected, state.version())?;

        state.truncate_before = state.truncate_before.max(position.value());
        Ok(())
    }

    async fn delete_stream(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        let mut inner = self.write()?;
        let current = inner
            .streams
            .get(stream)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?
            .version();
        check_expected(stream, expected, current)?;

        inner.streams.remove(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::event_store::READ_STREAM_PAGE_SIZE;

    fn stream(name: &str) -> StreamName {
        StreamName::new(name).unwrap()
    }

    fn events(n: usize) -> Vec<StreamEvent> {
        (0..n)
            .map(|i| StreamEvent::new("Tick", "application/json", format!("{{\"n\":{i}}}").into_bytes()))
            .collect()
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[tokio::test]
    async fn append_then_read_round_trip() {
        let store = InMemoryEventStore::new();
        let s = stream("order-1");

        let first = store
            .append_events(&s, ExpectedStreamVersion::NoStream, events(3))
            .await
            .unwrap();
        assert_eq!(first.next_expected_version, 2);

        let second = store
            .append_events(&s, ExpectedStreamVersion::Exact(2), events(2))
            .await
            .unwrap();
        assert_eq!(second.next_expected_version, 4);
        assert_eq!(second.global_position, 4);

        let read = store.read_events(&s, StreamReadPosition::START, 100).await.unwrap();
        let positions: Vec<_> = read.iter().map(|e| e.position().unwrap()).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);

        let back = store.read_events_backwards(&s, 2).await.unwrap();
        let positions: Vec<_> = back.iter().map(|e| e.position().unwrap()).collect();
        assert_eq!(positions, vec![4, 3]);
    }

    #[tokio::test]
    async fn global_positions_span_streams() {
        let store = InMemoryEventStore::new();
        store
            .append_events(&stream("a"), ExpectedStreamVersion::Any, events(2))
            .await
            .unwrap();
        let result = store
            .append_events(&stream("b"), ExpectedStreamVersion::Any, events(1))
            .await
            .unwrap();
        assert_eq!(result.next_expected_version, 0);
        assert_eq!(result.global_position, 2);
    }

    #[tokio::test]
    async fn missing_stream_is_not_found() {
        let store = InMemoryEventStore::new();
        let s = stream("nope");
        assert!(!store.stream_exists(&s).await.unwrap());
        assert_eq!(
            store.read_events(&s, StreamReadPosition::START, 1).await,
            Err(EventStoreError::StreamNotFound(s.clone()))
        );
        assert_eq!(
            store.read_events_backwards(&s, 1).await,
            Err(EventStoreError::StreamNotFound(s))
        );
    }

    #[tokio::test]
    async fn empty_append_is_rejected() {
        let store = InMemoryEventStore::new();
        let err = store
            .append_events(&stream("s"), ExpectedStreamVersion::Any, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[tokio::test]
    async fn truncate_hides_earlier_events() {
        let store = InMemoryEventStore::new();
        let s = stream("s");
        store
            .append_events(&s, ExpectedStreamVersion::NoStream, events(5))
            .await
            .unwrap();

        store
            .truncate_stream(&s, StreamTruncatePosition(3), ExpectedStreamVersion::Exact(4))
            .await
            .unwrap();

        let read = store.read_events(&s, StreamReadPosition::START, 10).await.unwrap();
        assert_eq!(read.first().and_then(StreamEvent::position), Some(3));
        assert_eq!(read.len(), 2);
        assert_eq!(store.stream_version(&s), Some(4));
    }

    #[tokio::test]
    async fn delete_then_recreate_starts_over() {
        let store = InMemoryEventStore::new();
        let s = stream("s");
        store
            .append_events(&s, ExpectedStreamVersion::NoStream, events(3))
            .await
            .unwrap();

        let conflict = store.delete_stream(&s, ExpectedStreamVersion::Exact(0)).await;
        assert!(matches!(conflict, Err(EventStoreError::ConcurrencyConflict { .. })));

        store.delete_stream(&s, ExpectedStreamVersion::Exact(2)).await.unwrap();
        assert!(!store.stream_exists(&s).await.unwrap());

        let result = store
            .append_events(&s, ExpectedStreamVersion::NoStream, events(1))
            .await
            .unwrap();
        assert_eq!(result.next_expected_version, 0);
    }

    #[tokio::test]
    async fn read_stream_visits_in_order() {
        let store = InMemoryEventStore::new();
        let s = stream("s");
        store
            .append_events(&s, ExpectedStreamVersion::NoStream, events(10))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let visited = store
            .read_stream(&s, StreamReadPosition(4), 3, &mut |e: StreamEvent| seen.push(e.position().unwrap()))
            .await
            .unwrap();
        assert_eq!(visited, 3);
        assert_eq!(seen, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn read_stream_pages_through_long_streams() {
        let store = InMemoryEventStore::new();
        let s = stream("long");
        let total = READ_STREAM_PAGE_SIZE * 2 + 7;
        store
            .append_events(&s, ExpectedStreamVersion::NoStream, events(total))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let visited = store
            .read_stream(&s, StreamReadPosition(3), usize::MAX, &mut |e: StreamEvent| {
                seen.push(e.position().unwrap())
            })
            .await
            .unwrap();
        assert_eq!(visited, (total - 3) as u64);
        assert_eq!(seen, (3..total as u64).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn exact_append_succeeds_iff_version_matches(existing in 0usize..6, expected in 0u64..8) {
            let store = InMemoryEventStore::new();
            let s = stream("cas");
            if existing > 0 {
                block_on(store.append_events(&s, ExpectedStreamVersion::NoStream, events(existing))).unwrap();
            }
            let before = store.stream_version(&s);

            let result = block_on(store.append_events(&s, ExpectedStreamVersion::Exact(expected), events(1)));

            if before == Some(expected) {
                prop_assert_eq!(result.unwrap().next_expected_version, expected + 1);
            } else {
                let is_conflict = matches!(result, Err(EventStoreError::ConcurrencyConflict { .. }));
                prop_assert!(is_conflict);
                prop_assert_eq!(store.stream_version(&s), before);
            }
        }
    }
}
