//! Checkpoint persistence port and the engine-side commit bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use eventflow_core::Checkpoint;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointStoreError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

/// Durable cursor persistence keyed by subscription id.
///
/// The engine keeps at most one update in flight per subscription id, so
/// implementations need not order concurrent writers for the same id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last stored checkpoint, or an empty one if none exists.
    async fn get_last_checkpoint(&self, subscription_id: &str) -> Result<Checkpoint, CheckpointStoreError>;

    /// Store `checkpoint`. With `force` the value is durable on return;
    /// otherwise the store may coalesce rapid updates.
    async fn store_checkpoint(&self, checkpoint: Checkpoint, force: bool) -> Result<Checkpoint, CheckpointStoreError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get_last_checkpoint(&self, subscription_id: &str) -> Result<Checkpoint, CheckpointStoreError> {
        (**self).get_last_checkpoint(subscription_id).await
    }

    async fn store_checkpoint(&self, checkpoint: Checkpoint, force: bool) -> Result<Checkpoint, CheckpointStoreError> {
        (**self).store_checkpoint(checkpoint, force).await
    }
}

/// In-memory checkpoint store; stored positions never move backwards.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<HashMap<String, Option<u64>>>,
    stores: AtomicU64,
    forced: AtomicU64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store_checkpoint` calls so far.
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Number of forced `store_checkpoint` calls so far.
    pub fn forced_count(&self) -> u64 {
        self.forced.load(Ordering::Relaxed)
    }

    /// Current value without going through the async port.
    pub fn position(&self, subscription_id: &str) -> Option<u64> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(subscription_id).copied().flatten())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_last_checkpoint(&self, subscription_id: &str) -> Result<Checkpoint, CheckpointStoreError> {
        let map = self
            .inner
            .read()
            .map_err(|_| CheckpointStoreError::Storage("lock poisoned".into()))?;
        Ok(Checkpoint::new(
            subscription_id,
            map.get(subscription_id).copied().flatten(),
        ))
    }

    async fn store_checkpoint(&self, checkpoint: Checkpoint, force: bool) -> Result<Checkpoint, CheckpointStoreError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| CheckpointStoreError::Storage("lock poisoned".into()))?;

        let existing = map.get(&checkpoint.id).copied().flatten();
        let stored = checkpoint.furthest(existing);
        map.insert(stored.id.clone(), stored.position);

        self.stores.fetch_add(1, Ordering::Relaxed);
        if force {
            self.forced.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stored)
    }
}

/// When the engine flushes processed positions to the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CheckpointCommitOptions {
    /// Commit after this many positions were processed.
    pub batch_size: u64,
    /// Commit at least this often while positions are pending.
    #[serde(rename = "interval_ms", deserialize_with = "millis::deserialize")]
    pub interval: Duration,
}

impl Default for CheckpointCommitOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_secs(5),
        }
    }
}

/// Serde helper for durations given in milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Slot {
    Pending,
    Done,
    Failed,
}

/// Engine-side single writer of a subscription's checkpoint.
///
/// Positions are registered in delivery order and acknowledged in any order.
/// The committable position is the end of the gap-free acknowledged prefix:
/// it never passes a position still in flight, nor one that failed fatally.
#[derive(Debug)]
pub struct CheckpointCommitter {
    options: CheckpointCommitOptions,
    in_flight: BTreeMap<u64, Slot>,
    last_processed: Option<u64>,
    last_committed: Option<u64>,
    since_commit: u64,
    last_commit_at: Instant,
    failed_at: Option<u64>,
}

impl CheckpointCommitter {
    /// Start from a loaded checkpoint position.
    pub fn new(start: Option<u64>, options: CheckpointCommitOptions) -> Self {
        Self {
            options,
            in_flight: BTreeMap::new(),
            last_processed: start,
            last_committed: start,
            since_commit: 0,
            last_commit_at: Instant::now(),
            failed_at: None,
        }
    }

    /// Record that `position` was dispatched into the pipe.
    pub fn register(&mut self, position: u64) {
        self.in_flight.insert(position, Slot::Pending);
    }

    /// Record the outcome for `position`. A fatal outcome pins the checkpoint
    /// below that position for good.
    pub fn acknowledge(&mut self, position: u64, fatal: bool) {
        let Some(slot) = self.in_flight.get_mut(&position) else {
            tracing::debug!(position, "acknowledgement for unknown position ignored");
            return;
        };
        if fatal {
            *slot = Slot::Failed;
            self.failed_at = Some(self.failed_at.map_or(position, |f| f.min(position)));
            return;
        }
        *slot = Slot::Done;

        while let Some(entry) = self.in_flight.first_entry() {
            if *entry.get() != Slot::Done {
                break;
            }
            let (done, _) = entry.remove_entry();
            self.last_processed = Some(done);
            self.since_commit += 1;
        }
    }

    /// Whether a commit is due at `now` under the batching policy.
    pub fn commit_due(&self, now: Instant) -> bool {
        self.pending_commit().is_some()
            && (self.since_commit >= self.options.batch_size
                || now.duration_since(self.last_commit_at) >= self.options.interval)
    }

    pub fn should_commit(&self) -> bool {
        self.commit_due(Instant::now())
    }

    /// Position to commit, if it moved since the last commit.
    pub fn pending_commit(&self) -> Option<u64> {
        match (self.last_processed, self.last_committed) {
            (Some(p), Some(c)) if p > c => Some(p),
            (Some(p), None) => Some(p),
            _ => None,
        }
    }

    pub fn mark_committed(&mut self, position: u64) {
        if self.last_committed.is_none_or(|c| position > c) {
            self.last_committed = Some(position);
        }
        self.since_commit = 0;
        self.last_commit_at = Instant::now();
    }

    /// Dispatched positions not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.values().filter(|s| **s == Slot::Pending).count()
    }

    /// Whether every dispatched position was acknowledged or failed.
    pub fn is_idle(&self) -> bool {
        self.in_flight.values().all(|s| *s != Slot::Pending)
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    pub fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    pub fn failed_at(&self) -> Option<u64> {
        self.failed_at
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn opts(batch_size: u64) -> CheckpointCommitOptions {
        CheckpointCommitOptions {
            batch_size,
            interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn in_memory_store_never_regresses() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.get_last_checkpoint("sub").await.unwrap().is_empty());

        store.store_checkpoint(Checkpoint::new("sub", Some(10)), true).await.unwrap();
        let stored = store.store_checkpoint(Checkpoint::new("sub", Some(4)), false).await.unwrap();

        assert_eq!(stored.position, Some(10));
        assert_eq!(store.get_last_checkpoint("sub").await.unwrap().position, Some(10));
        assert_eq!(store.store_count(), 2);
        assert_eq!(store.forced_count(), 1);
    }

    #[test]
    fn commit_options_read_milliseconds() {
        let parsed: CheckpointCommitOptions = serde_json::from_str(r#"{"interval_ms": 250}"#).unwrap();
        assert_eq!(
            parsed,
            CheckpointCommitOptions {
                batch_size: 100,
                interval: Duration::from_millis(250),
            }
        );
    }

    #[test]
    fn out_of_order_acks_wait_for_the_gap() {
        let mut committer = CheckpointCommitter::new(None, opts(1));
        for p in 0..3 {
            committer.register(p);
        }

        committer.acknowledge(2, false);
        committer.acknowledge(1, false);
        assert_eq!(committer.pending_commit(), None);
        assert_eq!(committer.in_flight_count(), 1);

        committer.acknowledge(0, false);
        assert_eq!(committer.pending_commit(), Some(2));
        assert!(committer.is_idle());
    }

    #[test]
    fn fatal_failure_pins_the_checkpoint() {
        let mut committer = CheckpointCommitter::new(Some(4), opts(1));
        for p in 5..9 {
            committer.register(p);
        }
        committer.acknowledge(5, false);
        committer.acknowledge(6, true);
        committer.acknowledge(7, false);
        committer.acknowledge(8, false);

        assert_eq!(committer.failed_at(), Some(6));
        assert_eq!(committer.pending_commit(), Some(5));
        assert!(committer.is_idle());
    }

    #[test]
    fn batching_by_count_and_interval() {
        let mut committer = CheckpointCommitter::new(None, opts(3));
        for p in 0..2 {
            committer.register(p);
            committer.acknowledge(p, false);
        }
        assert!(!committer.should_commit());

        committer.register(2);
        committer.acknowledge(2, false);
        assert!(committer.should_commit());
        committer.mark_committed(2);
        assert!(!committer.should_commit());
        assert_eq!(committer.last_committed(), Some(2));

        committer.register(3);
        committer.acknowledge(3, false);
        assert!(!committer.should_commit());
        assert!(committer.commit_due(Instant::now() + Duration::from_secs(3601)));
    }

    proptest! {
        #[test]
        fn committable_is_gap_free_prefix(order in Just((0u64..40).collect::<Vec<_>>()).prop_shuffle()) {
            let mut committer = CheckpointCommitter::new(None, opts(1));
            for p in 0..40 {
                committer.register(p);
            }

            let mut acked = vec![false; 40];
            for p in order {
                committer.acknowledge(p, false);
                acked[p as usize] = true;

                let prefix = acked.iter().take_while(|a| **a).count() as u64;
                let expected = prefix.checked_sub(1);
                prop_assert_eq!(committer.last_processed(), expected);
            }
            prop_assert_eq!(committer.pending_commit(), Some(39));
        }
    }
}
