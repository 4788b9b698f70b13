//! Catch-up subscription engine.
//!
//! One task per subscription reads its stream page by page, starting right
//! after the stored checkpoint, and pushes every event through the consume
//! pipe. Contexts report back over the acknowledgement channel and the
//! [`CheckpointCommitter`] turns those reports into commits that never pass a
//! message still in flight.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use eventflow_core::{Checkpoint, EventSerializer, StreamEvent, StreamReadPosition};
use eventflow_subscriptions::{
    Ack, AckReceiver, AckSender, Acknowledger, CancellationSignal, CancellationSource,
    CheckpointCommitter, CheckpointStore, CheckpointStoreError, ConsumeError, ConsumePipe,
    DropReason, HandlingStatus, MessageConsumeContext, SubscriptionState, ack_channel,
};

use super::error::SubscriptionError;
use super::handle::{SubscriptionHandle, SubscriptionStatus};
use super::options::StreamSubscriptionOptions;
use crate::event_store::{EventStore, EventStoreError};

type DropObserver = dyn Fn(DropReason, Option<&SubscriptionError>) + Send + Sync;

/// How reading ended: `None` when stopped, the drop otherwise.
type SessionEnd = Option<(DropReason, SubscriptionError)>;

/// One subscribe attempt: how reading ended and whether the final forced
/// checkpoint was stored.
struct SessionOutcome {
    end: SessionEnd,
    flushed: Result<(), CheckpointStoreError>,
}

/// A catch-up subscription to one stream.
///
/// Delivery is at-least-once: a position is committed only after its
/// context was acknowledged, so a crash between handling and committing
/// redelivers from the last commit.
pub struct StreamSubscription<S, C, Z> {
    store: Arc<S>,
    checkpoints: C,
    pipe: ConsumePipe,
    serializer: Z,
    options: StreamSubscriptionOptions,
    subscription_id: Arc<str>,
    on_dropped: Option<Arc<DropObserver>>,
}

impl<S, C, Z> core::fmt::Debug for StreamSubscription<S, C, Z> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("options", &self.options)
            .field("pipe", &self.pipe)
            .finish_non_exhaustive()
    }
}

impl<S, C, Z> StreamSubscription<S, C, Z>
where
    S: EventStore + 'static,
    C: CheckpointStore + 'static,
    Z: EventSerializer + 'static,
{
    pub fn new(
        store: S,
        checkpoints: C,
        pipe: ConsumePipe,
        serializer: Z,
        mut options: StreamSubscriptionOptions,
    ) -> Self {
        options.page_size = options.page_size.max(1);
        Self {
            store: Arc::new(store),
            checkpoints,
            pipe,
            serializer,
            subscription_id: Arc::from(options.subscription_id.as_str()),
            options,
            on_dropped: None,
        }
    }

    /// Called on every drop with its reason and cause, before any resubscribe.
    pub fn on_dropped<F>(mut self, observer: F) -> Self
    where
        F: Fn(DropReason, Option<&SubscriptionError>) + Send + Sync + 'static,
    {
        self.on_dropped = Some(Arc::new(observer));
        self
    }

    /// Spawn the read loop on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(self) -> SubscriptionHandle {
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::stopped());
        let cancel = CancellationSource::new();
        let signal = cancel.signal();
        let store: Arc<dyn EventStore> = self.store.clone();
        let subscription_id = self.options.subscription_id.clone();
        let stream = self.options.stream.clone();

        let task = tokio::spawn(self.run(status_tx, signal));
        SubscriptionHandle::new(subscription_id, stream, store, status_rx, cancel, task)
    }

    async fn run(
        self,
        status: watch::Sender<SubscriptionStatus>,
        signal: CancellationSignal,
    ) -> Result<(), SubscriptionError> {
        let mut resubscribing = false;

        loop {
            let state = if resubscribing {
                SubscriptionState::Resubscribing
            } else {
                SubscriptionState::Subscribing
            };
            status.send_modify(|s| s.state = state);

            let outcome = match self.checkpoints.get_last_checkpoint(&self.subscription_id).await {
                Ok(checkpoint) => self.session(checkpoint, &status, &signal).await,
                Err(err) if resubscribing => SessionOutcome {
                    end: Some((DropReason::ConnectionLost, SubscriptionError::CheckpointStore(err))),
                    flushed: Ok(()),
                },
                Err(err) => {
                    error!(subscription = %self.subscription_id, error = %err, "failed to load checkpoint");
                    status.send_modify(|s| s.state = SubscriptionState::Stopped);
                    return Err(SubscriptionError::CheckpointStore(err));
                }
            };

            let Some((reason, cause)) = outcome.end else {
                status.send_modify(|s| s.state = SubscriptionState::Stopped);
                return match outcome.flushed {
                    Ok(()) => {
                        info!(subscription = %self.subscription_id, "subscription stopped");
                        Ok(())
                    }
                    Err(err) => {
                        error!(subscription = %self.subscription_id, error = %err, "checkpoint not stored on stop");
                        Err(SubscriptionError::CheckpointStore(err))
                    }
                };
            };

            // Dropped stays the final state when the task ends here.
            status.send_modify(|s| s.state = SubscriptionState::Dropped(reason));
            if let Err(err) = outcome.flushed {
                let err = SubscriptionError::CheckpointStore(err);
                error!(
                    subscription = %self.subscription_id,
                    %reason,
                    drop = %cause,
                    error = %err,
                    "checkpoint not stored after drop"
                );
                self.notify_dropped(reason, &err);
                return Err(err);
            }
            self.notify_dropped(reason, &cause);

            if !reason.is_recoverable() {
                error!(subscription = %self.subscription_id, %reason, error = %cause, "subscription dropped");
                return Err(SubscriptionError::Dropped {
                    reason,
                    message: cause.to_string(),
                });
            }

            warn!(
                subscription = %self.subscription_id,
                %reason,
                error = %cause,
                delay_ms = self.options.resubscribe_delay.as_millis() as u64,
                "subscription dropped; resubscribing"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.resubscribe_delay) => resubscribing = true,
                _ = signal.cancelled() => {
                    status.send_modify(|s| s.state = SubscriptionState::Stopped);
                    return Ok(());
                }
            }
        }
    }

    fn notify_dropped(&self, reason: DropReason, cause: &SubscriptionError) {
        if let Some(observer) = &self.on_dropped {
            observer(reason, Some(cause));
        }
    }

    /// One subscribe attempt from `checkpoint`: read until stopped or dropped,
    /// then settle in-flight work and force the checkpoint.
    async fn session(
        &self,
        checkpoint: Checkpoint,
        status: &watch::Sender<SubscriptionStatus>,
        signal: &CancellationSignal,
    ) -> SessionOutcome {
        let mut committer = CheckpointCommitter::new(checkpoint.position, self.options.checkpoint);
        self.publish_progress(status, &committer);
        info!(
            subscription = %self.subscription_id,
            stream = %self.options.stream,
            checkpoint = ?checkpoint.position,
            "subscribing"
        );

        let (ack_tx, mut ack_rx) = ack_channel();
        let mut end = self
            .read_loop(&mut committer, &ack_tx, &mut ack_rx, status, signal)
            .await;

        drop(ack_tx);
        if let Some(err) = self.settle(&mut committer, &mut ack_rx).await {
            end.get_or_insert((DropReason::SubscriberError, err));
        }

        let flushed = self.force_checkpoint(&mut committer).await;
        self.publish_progress(status, &committer);

        SessionOutcome { end, flushed }
    }

    async fn force_checkpoint(&self, committer: &mut CheckpointCommitter) -> Result<(), CheckpointStoreError> {
        let Some(position) = committer.last_processed() else {
            return Ok(());
        };
        let stored = self
            .checkpoints
            .store_checkpoint(Checkpoint::new(&*self.subscription_id, Some(position)), true)
            .await?;
        committer.mark_committed(stored.position.unwrap_or(position));
        debug!(subscription = %self.subscription_id, position, "checkpoint forced");
        Ok(())
    }

    async fn read_loop(
        &self,
        committer: &mut CheckpointCommitter,
        ack_tx: &AckSender,
        ack_rx: &mut AckReceiver,
        status: &watch::Sender<SubscriptionStatus>,
        signal: &CancellationSignal,
    ) -> SessionEnd {
        let stream = &self.options.stream;
        let mut next = StreamReadPosition::after(committer.last_processed());
        let mut live = false;

        loop {
            if let Some(err) = self.drain(committer, ack_rx) {
                return Some((DropReason::SubscriberError, err));
            }
            self.commit_if_due(committer).await;
            self.publish_progress(status, committer);
            if signal.is_cancelled() {
                return None;
            }

            let page = match self.store.read_events(stream, next, self.options.page_size).await {
                Ok(page) => page,
                Err(EventStoreError::StreamNotFound(_)) => Vec::new(),
                Err(err) => {
                    let err = SubscriptionError::Store(err);
                    return Some((err.drop_reason(), err));
                }
            };

            if !live {
                live = true;
                status.send_modify(|s| s.state = SubscriptionState::Live);
                info!(subscription = %self.subscription_id, from = next.value(), "subscription live");
            }

            if page.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    _ = signal.cancelled() => {}
                }
                continue;
            }

            for event in page {
                let Some(position) = event.position() else {
                    warn!(subscription = %self.subscription_id, "event without a stream position skipped");
                    continue;
                };
                next = StreamReadPosition(position + 1);

                if let Err(err) = self.dispatch(event, position, committer, ack_tx, signal).await {
                    error!(subscription = %self.subscription_id, position, error = %err, "dispatch failed");
                    return Some((DropReason::SubscriberError, err));
                }
                if let Some(err) = self.drain(committer, ack_rx) {
                    return Some((DropReason::SubscriberError, err));
                }
                self.commit_if_due(committer).await;
                self.publish_progress(status, committer);

                if signal.is_cancelled() {
                    return None;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        event: StreamEvent,
        position: u64,
        committer: &mut CheckpointCommitter,
        ack_tx: &AckSender,
        signal: &CancellationSignal,
    ) -> Result<(), SubscriptionError> {
        if self.options.ignore_system_events && event.is_system() {
            debug!(
                subscription = %self.subscription_id,
                position,
                event_type = event.event_type(),
                "system event skipped"
            );
            committer.register(position);
            committer.acknowledge(position, false);
            return Ok(());
        }

        let mut failure = None;
        let payload = match self
            .serializer
            .deserialize(event.content_type(), event.event_type(), event.data())
        {
            Ok(payload) => payload,
            Err(source) if self.options.throw_on_error => {
                return Err(SubscriptionError::Deserialization {
                    position,
                    message_type: event.event_type().to_string(),
                    source,
                });
            }
            Err(source) => {
                warn!(
                    subscription = %self.subscription_id,
                    position,
                    event_type = event.event_type(),
                    error = %source,
                    "failed to deserialize event"
                );
                failure = Some(ConsumeError::Deserialization {
                    message_type: event.event_type().to_string(),
                    reason: source.to_string(),
                });
                None
            }
        };

        committer.register(position);
        let mut ctx = MessageConsumeContext::from_event(
            self.options.stream.clone(),
            &event,
            payload,
            self.subscription_id.clone(),
            signal.clone(),
            Acknowledger::new(position, ack_tx),
        );
        if let Some(err) = failure {
            ctx.nack(err);
        }

        debug!(
            subscription = %self.subscription_id,
            position,
            event_type = event.event_type(),
            "dispatching event"
        );
        self.pipe.send(ctx).await;
        Ok(())
    }

    fn drain(&self, committer: &mut CheckpointCommitter, acks: &mut AckReceiver) -> Option<SubscriptionError> {
        let mut fatal = None;
        while let Ok(ack) = acks.try_recv() {
            if let Some(err) = self.apply(committer, ack) {
                fatal.get_or_insert(err);
            }
        }
        fatal
    }

    /// Wait until every dispatched position reported back.
    async fn settle(&self, committer: &mut CheckpointCommitter, acks: &mut AckReceiver) -> Option<SubscriptionError> {
        let mut fatal = None;
        while !committer.is_idle() {
            let Some(ack) = acks.recv().await else {
                break;
            };
            if let Some(err) = self.apply(committer, ack) {
                fatal.get_or_insert(err);
            }
        }
        fatal
    }

    fn apply(&self, committer: &mut CheckpointCommitter, ack: Ack) -> Option<SubscriptionError> {
        let Ack { position, status } = ack;
        match status {
            HandlingStatus::Failed(source) if self.options.throw_on_error => {
                error!(subscription = %self.subscription_id, position, error = %source, "message failed");
                committer.acknowledge(position, true);
                Some(SubscriptionError::Handler { position, source })
            }
            HandlingStatus::Failed(source) => {
                warn!(
                    subscription = %self.subscription_id,
                    position,
                    error = %source,
                    "message failed; continuing"
                );
                committer.acknowledge(position, false);
                None
            }
            _ => {
                committer.acknowledge(position, false);
                None
            }
        }
    }

    async fn commit_if_due(&self, committer: &mut CheckpointCommitter) {
        if !committer.should_commit() {
            return;
        }
        let Some(position) = committer.pending_commit() else {
            return;
        };

        match self
            .checkpoints
            .store_checkpoint(Checkpoint::new(&*self.subscription_id, Some(position)), false)
            .await
        {
            Ok(stored) => {
                committer.mark_committed(stored.position.unwrap_or(position));
                debug!(subscription = %self.subscription_id, position, "checkpoint committed");
            }
            Err(err) => {
                // Superseded by the next successful commit.
                warn!(subscription = %self.subscription_id, position, error = %err, "checkpoint commit failed");
            }
        }
    }

    fn publish_progress(&self, status: &watch::Sender<SubscriptionStatus>, committer: &CheckpointCommitter) {
        status.send_if_modified(|s| {
            let processed = committer.last_processed();
            let committed = committer.last_committed();
            let changed = s.last_processed != processed || s.last_committed != committed;
            s.last_processed = processed;
            s.last_committed = committed;
            changed
        });
    }
}
