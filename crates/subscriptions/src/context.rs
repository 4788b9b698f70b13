//! Per-message processing envelope.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use eventflow_core::{Metadata, Payload, StreamEvent, StreamName};

use crate::ack::{Acknowledger, HandlingStatus};
use crate::error::ConsumeError;

/// Keys of the per-context item bag.
///
/// The bag is keyed by this closed set rather than free-form strings so
/// filters agree on what they store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    GlobalPosition,
    StreamPosition,
    PartitionKey,
    Partition,
    TraceId,
}

/// Value stored in the item bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextItem {
    Position(u64),
    Text(String),
}

impl ContextItem {
    pub fn as_position(&self) -> Option<u64> {
        match self {
            ContextItem::Position(p) => Some(*p),
            ContextItem::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextItem::Text(s) => Some(s),
            ContextItem::Position(_) => None,
        }
    }
}

/// Fires when the owning subscription stops.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Source dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owner side of a [`CancellationSignal`].
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned snapshot of a context's descriptive fields, for handler closures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub message_id: Uuid,
    pub message_type: String,
    pub stream: StreamName,
    pub stream_position: u64,
    pub global_position: u64,
    pub created: DateTime<Utc>,
    pub metadata: Metadata,
    pub subscription_id: Arc<str>,
}

/// Processing envelope for one delivered event.
///
/// Created by the engine for every raw event, moved through the consume pipe
/// and dropped once processing is over; dropping it acknowledges the message
/// with whatever status was recorded.
#[derive(Debug)]
pub struct MessageConsumeContext {
    message_id: Uuid,
    message_type: String,
    content_type: String,
    stream: StreamName,
    stream_position: u64,
    global_position: u64,
    created: DateTime<Utc>,
    payload: Option<Payload>,
    metadata: Metadata,
    subscription_id: Arc<str>,
    cancellation: CancellationSignal,
    items: HashMap<ContextKey, ContextItem>,
    ack: Acknowledger,
}

impl MessageConsumeContext {
    /// Build a context from a stored event. `ack` must be bound to the
    /// position the engine will checkpoint for this event.
    pub fn from_event(
        stream: StreamName,
        event: &StreamEvent,
        payload: Option<Payload>,
        subscription_id: Arc<str>,
        cancellation: CancellationSignal,
        ack: Acknowledger,
    ) -> Self {
        let stream_position = event.position().unwrap_or_default();
        let global_position = event.global_position().unwrap_or_default();

        let mut items = HashMap::new();
        items.insert(ContextKey::StreamPosition, ContextItem::Position(stream_position));
        items.insert(ContextKey::GlobalPosition, ContextItem::Position(global_position));

        Self {
            message_id: event.event_id(),
            message_type: event.event_type().to_string(),
            content_type: event.content_type().to_string(),
            stream,
            stream_position,
            global_position,
            created: event.created(),
            payload,
            metadata: event.metadata().clone(),
            subscription_id,
            cancellation,
            items,
            ack,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn global_position(&self) -> u64 {
        self.global_position
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Filters may enrich metadata before handlers see it.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    pub fn item(&self, key: ContextKey) -> Option<&ContextItem> {
        self.items.get(&key)
    }

    pub fn set_item(&mut self, key: ContextKey, item: ContextItem) {
        self.items.insert(key, item);
    }

    pub fn with_item(mut self, key: ContextKey, item: ContextItem) -> Self {
        self.set_item(key, item);
        self
    }

    /// Checkpoint position this context acknowledges.
    pub fn ack_position(&self) -> u64 {
        self.ack.position()
    }

    pub fn status(&self) -> &HandlingStatus {
        self.ack.status()
    }

    /// True once any handler processed the message.
    pub fn is_handled(&self) -> bool {
        matches!(self.ack.status(), HandlingStatus::Handled)
    }

    pub fn has_failed(&self) -> bool {
        self.ack.status().is_failed()
    }

    pub fn handled(&mut self) {
        self.ack.record(HandlingStatus::Handled);
    }

    pub fn ignore(&mut self) {
        self.ack.record(HandlingStatus::Ignored);
    }

    pub fn nack(&mut self, error: ConsumeError) {
        self.ack.record(HandlingStatus::Failed(error));
    }

    pub fn info(&self) -> MessageInfo {
        MessageInfo {
            message_id: self.message_id,
            message_type: self.message_type.clone(),
            stream: self.stream.clone(),
            stream_position: self.stream_position,
            global_position: self.global_position,
            created: self.created,
            metadata: self.metadata.clone(),
            subscription_id: self.subscription_id.clone(),
        }
    }
}
