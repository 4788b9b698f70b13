//! Subscription mechanics: consume contexts, the consume pipe, partitioned
//! fan-out, type-routed handlers and checkpoint bookkeeping.
//!
//! Nothing in this crate reads from a store. The catch-up engine that drives
//! these pieces from an event store lives in `eventflow-infra`.

pub mod ack;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod partitioning;
pub mod pipe;

pub use ack::{Ack, AckReceiver, AckSender, Acknowledger, HandlingStatus, ack_channel};
pub use checkpoint::{
    CheckpointCommitOptions, CheckpointCommitter, CheckpointStore, CheckpointStoreError,
    InMemoryCheckpointStore,
};
pub use context::{CancellationSignal, CancellationSource, ContextItem, ContextKey, MessageConsumeContext, MessageInfo};
pub use error::ConsumeError;
pub use handler::{EventHandler, EventHandlingStatus, HandlerDispatch, TypedEventHandler};
pub use lifecycle::{DropReason, SubscriptionState};
pub use partitioning::{PartitionBy, PartitioningError, PartitioningFilter, hash_partition_key};
pub use pipe::{ConsumeFilter, ConsumePipe, ConsumePipeBuilder, MessageFilter, Next};
