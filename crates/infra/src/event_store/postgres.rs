//! Postgres-backed event store implementation.
//!
//! Streams live in two tables: `streams` holds the current version and the
//! truncate mark of every live stream, `events` holds the events themselves
//! keyed by `(stream_name, stream_position)`. The store-wide order is the
//! `global_position` identity column.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation on `events_stream_position_key`) | `23505` | `ConcurrencyConflict` (append only) |
//! | Database (admin/crash shutdown) | `57P01`, `57P02`, `57P03` | `ServerStopped` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `ServerStopped` |
//! | Io, Tls, PoolTimedOut | N/A | `ConnectionLost` |
//! | Other | N/A | `Storage` |
//!
//! ## Optimistic Concurrency
//!
//! `append_events` locks the stream row (`SELECT ... FOR UPDATE`), checks the
//! expectation and inserts inside one transaction. Two writers racing to
//! create the same stream both see no row; the unique constraint on
//! `(stream_name, stream_position)` rejects the loser.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use eventflow_core::{
    AppendEventsResult, ExpectedStreamVersion, Metadata, StreamEvent, StreamName,
    StreamReadPosition, StreamTruncatePosition,
};

use super::r#trait::{EventStore, EventStoreError};

/// DDL for the tables used by [`PostgresEventStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    stream_name     TEXT PRIMARY KEY,
    version         BIGINT NOT NULL CHECK (version >= 0),
    truncate_before BIGINT NOT NULL DEFAULT 0 CHECK (truncate_before >= 0)
);

CREATE TABLE IF NOT EXISTS events (
    global_position BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    stream_name     TEXT NOT NULL,
    stream_position BIGINT NOT NULL CHECK (stream_position >= 0),
    event_id        UUID NOT NULL,
    event_type      TEXT NOT NULL,
    content_type    TEXT NOT NULL,
    data            BYTEA NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
    created         TIMESTAMPTZ NOT NULL,
    CONSTRAINT events_event_id_key UNIQUE (event_id),
    CONSTRAINT events_stream_position_key UNIQUE (stream_name, stream_position)
);
"#;

/// Unique constraint that loses a create race; any other violation is a
/// storage error (a reused `event_id`, for instance).
const STREAM_POSITION_CONSTRAINT: &str = "events_stream_position_key";

const EVENT_COLUMNS: &str = "global_position, stream_position, event_id, event_type, content_type, data, metadata, created";

/// Postgres-backed append-only event store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream = %stream), err)]
    async fn exists(&self, stream: &StreamName) -> Result<bool, EventStoreError> {
        Ok(self.stream_row(stream).await?.is_some())
    }

    #[instrument(
        skip(self, events),
        fields(
            stream = %stream,
            expected = %expected,
            event_count = events.len(),
            committed_version = tracing::field::Empty
        ),
        err
    )]
    async fn append(
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = lock_stream(&mut tx, stream).await?.map(|row| row.version);
        if !expected.matches(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.clone(),
                expected,
                actual: current,
            });
        }

        let mut next_position = current.map_or(0, |v| v + 1);
        let mut last_global = 0u64;

        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    stream_name,
                    stream_position,
                    event_id,
                    event_type,
                    content_type,
                    data,
                    metadata,
                    created
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING global_position
                "#,
            )
            .bind(stream.as_str())
            .bind(next_position as i64)
            .bind(event.event_id())
            .bind(event.event_type())
            .bind(event.content_type())
            .bind(event.data())
            .bind(Json(event.metadata()))
            .bind(event.created())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_position_conflict(&e) {
                    EventStoreError::ConcurrencyConflict {
                        stream: stream.clone(),
                        expected,
                        actual: current,
                    }
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let global: i64 = row
                .try_get("global_position")
                .map_err(|e| EventStoreError::Storage(format!("failed to read global_position: {e}")))?;
            last_global = global as u64;
            next_position += 1;
        }

        let version = next_position - 1;
        sqlx::query(
            r#"
            INSERT INTO streams (stream_name, version)
            VALUES ($1, $2)
            ON CONFLICT (stream_name)
            DO UPDATE SET version = EXCLUDED.version
            "#,
        )
        .bind(stream.as_str())
        .bind(version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_stream_version", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_version", version);
        Ok(AppendEventsResult {
            next_expected_version: version,
            global_position: last_global,
        })
    }

    #[instrument(skip(self), fields(stream = %stream, start = start.value()), err)]
    async fn read_forward(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        let state = self
            .stream_row(stream)
            .await?
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE stream_name = $1 AND stream_position >= $2 \
             ORDER BY stream_position ASC LIMIT $3"
        ))
        .bind(stream.as_str())
        .bind(start.value().max(state.truncate_before) as i64)
        .bind(limit(count))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_events", e))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), fields(stream = %stream), err)]
    async fn read_backward(&self, stream: &StreamName, count: usize) -> Result<Vec<StreamEvent>, EventStoreError> {
        let state = self
            .stream_row(stream)
            .await?
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE stream_name = $1 AND stream_position >= $2 \
             ORDER BY stream_position DESC LIMIT $3"
        ))
        .bind(stream.as_str())
        .bind(state.truncate_before as i64)
        .bind(limit(count))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_events_backwards", e))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self, callback), fields(stream = %stream, start = start.value(), visited = tracing::field::Empty), err)]
    async fn visit(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
        callback: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<u64, EventStoreError> {
        let state = self
            .stream_row(stream)
            .await?
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE stream_name = $1 AND stream_position >= $2 \
             ORDER BY stream_position ASC LIMIT $3"
        );
        let mut rows = sqlx::query(&sql)
            .bind(stream.as_str())
            .bind(start.value().max(state.truncate_before) as i64)
            .bind(limit(count))
            .fetch(&*self.pool);

        let mut visited = 0u64;
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| map_sqlx_error("read_stream", e))?
        {
            callback(event_from_row(&row)?);
            visited += 1;
        }

        Span::current().record("visited", visited);
        Ok(visited)
    }

    #[instrument(skip(self), fields(stream = %stream, position = position.value(), expected = %expected), err)]
    async fn truncate(
        &self,
        stream: &StreamName,
        position: StreamTruncatePosition,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let state = lock_stream(&mut tx, stream)
            .await?
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;
        if !expected.matches(Some(state.version)) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.clone(),
                expected,
                actual: Some(state.version),
            });
        }

        sqlx::query(
            r#"
            UPDATE streams
            SET truncate_before = GREATEST(truncate_before, $2)
            WHERE stream_name = $1
            "#,
        )
        .bind(stream.as_str())
        .bind(position.value() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("truncate_stream", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(stream = %stream, expected = %expected), err)]
    async fn delete(&self, stream: &StreamName, expected: ExpectedStreamVersion) -> Result<(), EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let state = lock_stream(&mut tx, stream)
            .await?
            .ok_or_else(|| EventStoreError::StreamNotFound(stream.clone()))?;
        if !expected.matches(Some(state.version)) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.clone(),
                expected,
                actual: Some(state.version),
            });
        }

        sqlx::query("DELETE FROM events WHERE stream_name = $1")
            .bind(stream.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_events", e))?;
        sqlx::query("DELETE FROM streams WHERE stream_name = $1")
            .bind(stream.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_stream", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn stream_row(&self, stream: &StreamName) -> Result<Option<StreamRow>, EventStoreError> {
        let row = sqlx::query("SELECT version, truncate_before FROM streams WHERE stream_name = $1")
            .bind(stream.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_stream_state", e))?;

        row.map(|r| StreamRow::from_row(&r))
            .transpose()
            .map_err(|e| EventStoreError::Storage(format!("failed to deserialize stream row: {e}")))
    }
}

/// Lock and read the stream row inside `tx`.
async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream: &StreamName,
) -> Result<Option<StreamRow>, EventStoreError> {
    let row = sqlx::query("SELECT version, truncate_before FROM streams WHERE stream_name = $1 FOR UPDATE")
        .bind(stream.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stream", e))?;

    row.map(|r| StreamRow::from_row(&r))
        .transpose()
        .map_err(|e| EventStoreError::Storage(format!("failed to deserialize stream row: {e}")))
}

fn limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("57P01" | "57P02" | "57P03") => EventStoreError::ServerStopped(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::ServerStopped(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => EventStoreError::ConnectionLost(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => EventStoreError::ConnectionLost(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            EventStoreError::ConnectionLost(format!("timed out acquiring a connection in {operation}"))
        }
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_position_conflict(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    db_err.code().is_some_and(|code| code.as_ref() == "23505")
        && db_err.constraint() == Some(STREAM_POSITION_CONSTRAINT)
}

// SQLx row types

#[derive(Debug)]
struct StreamRow {
    version: u64,
    truncate_before: u64,
}

impl<'r> FromRow<'r, PgRow> for StreamRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let version: i64 = row.try_get("version")?;
        let truncate_before: i64 = row.try_get("truncate_before")?;
        Ok(StreamRow {
            version: version as u64,
            truncate_before: truncate_before as u64,
        })
    }
}

#[derive(Debug)]
struct EventRow {
    global_position: i64,
    stream_position: i64,
    event_id: uuid::Uuid,
    event_type: String,
    content_type: String,
    data: Vec<u8>,
    metadata: Json<Metadata>,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            global_position: row.try_get("global_position")?,
            stream_position: row.try_get("stream_position")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            content_type: row.try_get("content_type")?,
            data: row.try_get("data")?,
            metadata: row.try_get("metadata")?,
            created: row.try_get("created")?,
        })
    }
}

impl From<EventRow> for StreamEvent {
    fn from(row: EventRow) -> Self {
        StreamEvent::new(row.event_type, row.content_type, row.data)
            .with_id(row.event_id)
            .with_metadata(row.metadata.0)
            .with_created(row.created)
            .with_positions(row.stream_position as u64, row.global_position as u64)
    }
}

fn event_from_row(row: &PgRow) -> Result<StreamEvent, EventStoreError> {
    EventRow::from_row(row)
        .map(StreamEvent::from)
        .map_err(|e| EventStoreError::Storage(format!("failed to deserialize event row: {e}")))
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn stream_exists(&self, stream: &StreamName) -> Result<bool, EventStoreError> {
        self.exists(stream).await
    }

    async fn append_events(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
        events: Vec<StreamEvent>,
    ) -> Result<AppendEventsResult, EventStoreError> {
        self.append(stream, expected, events).await
    }

    async fn read_events(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        self.read_forward(stream, start, count).await
    }

    async fn read_events_backwards(
        &self,
        stream: &StreamName,
        count: usize,
    ) -> Result<Vec<StreamEvent>, EventStoreError> {
        self.read_backward(stream, count).await
    }

    async fn read_stream(
        &self,
        stream: &StreamName,
        start: StreamReadPosition,
        count: usize,
        callback: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<u64, EventStoreError> {
        self.visit(stream, start, count, callback).await
    }

    async fn truncate_stream(
        &self,
        stream: &StreamName,
        position: StreamTruncatePosition,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        self.truncate(stream, position, expected).await
    }

    async fn delete_stream(
        &self,
        stream: &StreamName,
        expected: ExpectedStreamVersion,
    ) -> Result<(), EventStoreError> {
        self.delete(stream, expected).await
    }
}
