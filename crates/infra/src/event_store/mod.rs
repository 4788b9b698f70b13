//! Append-only event store boundary.
//!
//! [`EventStore`] is the port; [`InMemoryEventStore`] and
//! [`PostgresEventStore`] are the adapters, and [`TracedEventStore`] wraps any
//! of them with spans and trace propagation. Wrappers nest freely.

pub mod in_memory;
pub mod postgres;
pub mod traced;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use traced::TracedEventStore;
pub use r#trait::{EventStore, EventStoreError, READ_STREAM_PAGE_SIZE};
