use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved metadata keys written by the infrastructure.
pub mod meta_keys {
    pub const TRACE_ID: &str = "$traceId";
    pub const SPAN_ID: &str = "$spanId";
    pub const PARENT_SPAN_ID: &str = "$parentSpanId";
    pub const CORRELATION_ID: &str = "$correlationId";
    pub const CAUSATION_ID: &str = "$causationId";
}

/// A single metadata value: text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            MetaValue::Bytes(_) => None,
        }
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for MetaValue {
    fn from(value: Vec<u8>) -> Self {
        MetaValue::Bytes(value)
    }
}

/// Ordered event metadata (string keys, text or byte values).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    /// Text value for `key`, if present and textual.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(MetaValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, MetaValue)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, MetaValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An event as written to, or read from, a stream.
///
/// `StreamEvent` is immutable: the `with_*` methods consume the value and
/// return a new one. Events built for an append carry no position; the store
/// assigns `position` (stream-scoped, 0-based) and `global_position`
/// (store-wide) when it persists them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    event_id: Uuid,
    event_type: String,
    content_type: String,
    data: Vec<u8>,
    metadata: Metadata,
    position: Option<u64>,
    global_position: Option<u64>,
    created: DateTime<Utc>,
}

impl StreamEvent {
    /// Create a new event ready to be appended.
    pub fn new(
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            content_type: content_type.into(),
            data: data.into(),
            metadata: Metadata::default(),
            position: None,
            global_position: None,
            created: Utc::now(),
        }
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    /// Stamp the positions assigned by a store on append.
    pub fn with_positions(mut self, position: u64, global_position: u64) -> Self {
        self.position = Some(position);
        self.global_position = Some(global_position);
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn global_position(&self) -> Option<u64> {
        self.global_position
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// System events follow the `$`-prefixed naming convention.
    pub fn is_system(&self) -> bool {
        self.event_type.starts_with('$')
    }
}

/// Outcome of a successful append.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEventsResult {
    /// Version of the stream after the append (position of the last event).
    pub next_expected_version: u64,
    /// Store-wide position of the last appended event.
    pub global_position: u64,
}
