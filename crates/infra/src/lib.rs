//! Storage adapters and the catch-up subscription engine.

pub mod checkpoints;
pub mod event_store;
pub mod subscription;

pub use checkpoints::PostgresCheckpointStore;
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, TracedEventStore,
};
pub use subscription::{
    StreamSubscription, StreamSubscriptionOptions, SubscriptionError, SubscriptionGap,
    SubscriptionHandle, SubscriptionStatus,
};
