use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use eventflow_core::{StreamEvent, StreamName};
use eventflow_subscriptions::{CancellationSource, SubscriptionState};

use super::error::SubscriptionError;
use crate::event_store::{EventStore, EventStoreError};

/// Snapshot of a running subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    /// End of the gap-free prefix of acknowledged positions.
    pub last_processed: Option<u64>,
    /// Last position written to the checkpoint store.
    pub last_committed: Option<u64>,
}

impl SubscriptionStatus {
    pub(crate) fn stopped() -> Self {
        Self {
            state: SubscriptionState::Stopped,
            last_processed: None,
            last_committed: None,
        }
    }
}

/// How far a subscription trails the end of its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionGap {
    pub subscription_id: String,
    pub position_gap: u64,
    pub timestamp: DateTime<Utc>,
}

/// Control side of a started subscription.
///
/// Dropping the handle detaches the subscription; it keeps running until its
/// task ends on its own.
pub struct SubscriptionHandle {
    subscription_id: String,
    stream: StreamName,
    store: Arc<dyn EventStore>,
    status: watch::Receiver<SubscriptionStatus>,
    cancel: CancellationSource,
    task: JoinHandle<Result<(), SubscriptionError>>,
}

impl core::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("subscription_id", &self.subscription_id)
            .field("stream", &self.stream)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    pub(crate) fn new(
        subscription_id: String,
        stream: StreamName,
        store: Arc<dyn EventStore>,
        status: watch::Receiver<SubscriptionStatus>,
        cancel: CancellationSource,
        task: JoinHandle<Result<(), SubscriptionError>>,
    ) -> Self {
        Self {
            subscription_id,
            stream,
            store,
            status,
            cancel,
            task,
        }
    }

    /// The id checkpoints are stored under.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the status satisfies `predicate`. If the subscription ends
    /// first, the final status is returned.
    pub async fn wait_for<F>(&self, mut predicate: F) -> SubscriptionStatus
    where
        F: FnMut(&SubscriptionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let reached = rx
            .wait_for(|status| predicate(status))
            .await
            .map(|status| status.clone());
        reached.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Distance between the stream's tail and the last processed position.
    pub async fn gap(&self) -> Result<SubscriptionGap, EventStoreError> {
        let tail = match self.store.read_events_backwards(&self.stream, 1).await {
            Ok(events) => events.first().and_then(StreamEvent::position),
            Err(EventStoreError::StreamNotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let processed = self.status.borrow().last_processed;
        let position_gap = match (tail, processed) {
            (Some(tail), Some(processed)) => tail.saturating_sub(processed),
            (Some(tail), None) => tail + 1,
            (None, _) => 0,
        };

        Ok(SubscriptionGap {
            subscription_id: self.subscription_id.clone(),
            position_gap,
            timestamp: Utc::now(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop dispatching, let in-flight work finish, force the checkpoint and
    /// wait for the subscription task to end.
    pub async fn stop(self) -> Result<(), SubscriptionError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the subscription task to end on its own.
    pub async fn join(self) -> Result<(), SubscriptionError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(SubscriptionError::Task(err.to_string())),
        }
    }
}
