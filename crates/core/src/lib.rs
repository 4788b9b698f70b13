//! `eventflow-core`: stream and event primitives.
//!
//! This crate contains the **storage-agnostic** building blocks shared by the
//! event store port, the subscription pipeline and the adapters. No IO lives
//! here.

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod serialization;
pub mod stream;
pub mod trace;

pub use checkpoint::Checkpoint;
pub use error::{CoreError, CoreResult};
pub use event::{AppendEventsResult, MetaValue, Metadata, StreamEvent, meta_keys};
pub use serialization::{
    EventSerializer, JsonEventSerializer, Payload, SerializationError, SerializedEvent, TypeMap,
    JSON_CONTENT_TYPE,
};
pub use stream::{ExpectedStreamVersion, StreamName, StreamReadPosition, StreamTruncatePosition};
pub use trace::TraceContext;
