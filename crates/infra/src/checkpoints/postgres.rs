//! Postgres-backed checkpoint store.
//!
//! One row per subscription id. Writes go through an upsert that keeps the
//! greater of the stored and the new position, so a late or replayed write
//! can never move a checkpoint backwards.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use eventflow_core::Checkpoint;
use eventflow_subscriptions::{CheckpointStore, CheckpointStoreError};

/// DDL for the table used by [`PostgresCheckpointStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    subscription_id TEXT PRIMARY KEY,
    position        BIGINT NULL CHECK (position >= 0),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Postgres-backed checkpoint store.
///
/// Every write that reaches the database is durable on commit. Non-forced
/// writes that would not move the last position this instance wrote are
/// skipped.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
    written: Arc<RwLock<HashMap<String, u64>>>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            written: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create the table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn already_written(&self, checkpoint: &Checkpoint) -> bool {
        let Some(position) = checkpoint.position else {
            return true;
        };
        self.written
            .read()
            .ok()
            .and_then(|w| w.get(&checkpoint.id).copied())
            .is_some_and(|last| last >= position)
    }

    fn remember(&self, checkpoint: &Checkpoint) {
        if let (Some(position), Ok(mut written)) = (checkpoint.position, self.written.write()) {
            written.insert(checkpoint.id.clone(), position);
        }
    }
}

#[derive(Debug)]
struct CheckpointRow {
    position: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for CheckpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CheckpointRow {
            position: row.try_get("position")?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CheckpointStoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            CheckpointStoreError::Unavailable(format!("{operation}: {err}"))
        }
        other => CheckpointStoreError::Storage(format!("{operation}: {other}")),
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), err)]
    async fn get_last_checkpoint(&self, subscription_id: &str) -> Result<Checkpoint, CheckpointStoreError> {
        let row = sqlx::query("SELECT position FROM checkpoints WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_last_checkpoint", e))?;

        let position = row
            .map(|r| CheckpointRow::from_row(&r))
            .transpose()
            .map_err(|e| CheckpointStoreError::Storage(format!("failed to deserialize checkpoint row: {e}")))?
            .and_then(|r| r.position)
            .map(|p| p as u64);

        let checkpoint = Checkpoint::new(subscription_id, position);
        self.remember(&checkpoint);
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(subscription_id = %checkpoint.id, position = ?checkpoint.position), err)]
    async fn store_checkpoint(&self, checkpoint: Checkpoint, force: bool) -> Result<Checkpoint, CheckpointStoreError> {
        if !force && self.already_written(&checkpoint) {
            return Ok(checkpoint);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO checkpoints (subscription_id, position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (subscription_id)
            DO UPDATE SET
                position = GREATEST(checkpoints.position, EXCLUDED.position),
                updated_at = NOW()
            RETURNING position
            "#,
        )
        .bind(&checkpoint.id)
        .bind(checkpoint.position.map(|p| p as i64))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_checkpoint", e))?;

        let stored = CheckpointRow::from_row(&row)
            .map_err(|e| CheckpointStoreError::Storage(format!("failed to deserialize checkpoint row: {e}")))?;
        let stored = Checkpoint::new(checkpoint.id, stored.position.map(|p| p as u64));
        self.remember(&stored);
        Ok(stored)
    }
}
