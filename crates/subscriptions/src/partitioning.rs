//! Fan-out of one ordered feed into N ordered lanes.
//!
//! Each lane is a bounded queue drained by one spawned worker, so messages
//! that map to the same lane are processed strictly in delivery order while
//! different lanes run concurrently. `send` awaits queue capacity: a full
//! lane suspends the caller, which is the subscription's single reader.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::context::{ContextItem, ContextKey, MessageConsumeContext};
use crate::error::ConsumeError;
use crate::pipe::{ConsumeFilter, Next};

pub const DEFAULT_LANE_CAPACITY: usize = 256;

/// Stable 64-bit FNV-1a hash of a partition key.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref()
        .iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitioningError {
    #[error("partition count must be at least 1")]
    ZeroPartitions,

    #[error("lane capacity must be at least 1")]
    ZeroCapacity,

    #[error("partition workers need a running tokio runtime")]
    NoRuntime,
}

type KeyFn = dyn Fn(&MessageConsumeContext) -> String + Send + Sync;
type HashFn = dyn Fn(&MessageConsumeContext) -> u64 + Send + Sync;

/// How a context's partition is derived.
#[derive(Clone)]
pub enum PartitionBy {
    /// Key extracted from the context, hashed with [`hash_partition_key`].
    Key(Arc<KeyFn>),
    /// Hash computed directly from the context.
    Hash(Arc<HashFn>),
}

impl PartitionBy {
    pub fn key<F>(f: F) -> Self
    where
        F: Fn(&MessageConsumeContext) -> String + Send + Sync + 'static,
    {
        PartitionBy::Key(Arc::new(f))
    }

    pub fn hash<F>(f: F) -> Self
    where
        F: Fn(&MessageConsumeContext) -> u64 + Send + Sync + 'static,
    {
        PartitionBy::Hash(Arc::new(f))
    }

    /// Partition by stream name.
    pub fn stream() -> Self {
        Self::key(|ctx| ctx.stream().to_string())
    }

    /// Hash of `ctx`, with the key when one was extracted.
    fn resolve(&self, ctx: &MessageConsumeContext) -> (u64, Option<String>) {
        match self {
            PartitionBy::Key(f) => {
                let key = f(ctx);
                (hash_partition_key(&key), Some(key))
            }
            PartitionBy::Hash(f) => (f(ctx), None),
        }
    }
}

impl core::fmt::Debug for PartitionBy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PartitionBy::Key(_) => f.write_str("PartitionBy::Key"),
            PartitionBy::Hash(_) => f.write_str("PartitionBy::Hash"),
        }
    }
}

/// Lane index for `hash` among `count` lanes.
pub fn lane_for(hash: u64, count: usize) -> usize {
    (hash % count as u64) as usize
}

type LaneItem = (MessageConsumeContext, Next);

/// Pipe stage dispatching each context to one of N ordered lanes.
pub struct PartitioningFilter {
    by: PartitionBy,
    // Dropping the senders lets each worker drain its queue and exit.
    lanes: Vec<mpsc::Sender<LaneItem>>,
}

impl PartitioningFilter {
    /// `count` lanes with the default queue capacity. Must be called from
    /// within a tokio runtime.
    pub fn new(count: usize, by: PartitionBy) -> Result<Self, PartitioningError> {
        Self::with_capacity(count, by, DEFAULT_LANE_CAPACITY)
    }

    pub fn with_capacity(count: usize, by: PartitionBy, capacity: usize) -> Result<Self, PartitioningError> {
        if count == 0 {
            return Err(PartitioningError::ZeroPartitions);
        }
        if capacity == 0 {
            return Err(PartitioningError::ZeroCapacity);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PartitioningError::NoRuntime)?;

        let lanes = (0..count)
            .map(|lane| {
                let (tx, rx) = mpsc::channel(capacity);
                runtime.spawn(lane_worker(lane, rx));
                tx
            })
            .collect();

        Ok(Self { by, lanes })
    }

    pub fn partition_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane `ctx` would be routed to.
    pub fn lane_of(&self, ctx: &MessageConsumeContext) -> usize {
        lane_for(self.by.resolve(ctx).0, self.lanes.len())
    }

    /// Free slots in a lane's queue.
    pub fn lane_capacity(&self, lane: usize) -> Option<usize> {
        self.lanes.get(lane).map(mpsc::Sender::capacity)
    }
}

async fn lane_worker(lane: usize, mut rx: mpsc::Receiver<LaneItem>) {
    tracing::debug!(lane, "partition lane started");
    while let Some((ctx, next)) = rx.recv().await {
        // A panicking stage fails its own message; the lane keeps going.
        if AssertUnwindSafe(next.run(ctx)).catch_unwind().await.is_err() {
            tracing::error!(lane, "partition lane stage panicked");
        }
    }
    tracing::debug!(lane, "partition lane stopped");
}

#[async_trait]
impl ConsumeFilter for PartitioningFilter {
    async fn send(&self, mut ctx: MessageConsumeContext, next: Next) {
        let (hash, key) = self.by.resolve(&ctx);
        let lane = lane_for(hash, self.lanes.len());

        if let Some(key) = key {
            ctx.set_item(ContextKey::PartitionKey, ContextItem::Text(key));
        }
        ctx.set_item(ContextKey::Partition, ContextItem::Position(lane as u64));

        if let Err(mpsc::error::SendError((mut ctx, _))) = self.lanes[lane].send((ctx, next)).await {
            tracing::warn!(lane, "partition lane closed, message not dispatched");
            ctx.nack(ConsumeError::LaneClosed(lane));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::ack::{HandlingStatus, ack_channel};
    use crate::context::test_support::context;
    use crate::handler::{EventHandler, EventHandlingStatus, HandlerDispatch};
    use crate::pipe::ConsumePipe;

    /// Records `(lane, stream_position)` per handled message.
    #[derive(Clone, Default)]
    struct LaneRecorder(Arc<Mutex<Vec<(u64, u64)>>>);

    #[async_trait]
    impl EventHandler for LaneRecorder {
        fn handler_type(&self) -> &str {
            "lanes"
        }

        async fn handle(&self, ctx: &MessageConsumeContext) -> Result<EventHandlingStatus, ConsumeError> {
            let lane = ctx
                .item(ContextKey::Partition)
                .and_then(ContextItem::as_position)
                .unwrap_or(u64::MAX);
            // Yield so lanes interleave.
            tokio::task::yield_now().await;
            self.0.lock().unwrap().push((lane, ctx.stream_position()));
            Ok(EventHandlingStatus::Handled)
        }
    }

    /// Blocks until a permit is released.
    struct Gate(Arc<Semaphore>);

    #[async_trait]
    impl EventHandler for Gate {
        fn handler_type(&self) -> &str {
            "gate"
        }

        async fn handle(&self, _ctx: &MessageConsumeContext) -> Result<EventHandlingStatus, ConsumeError> {
            let permit = self.0.acquire().await;
            drop(permit);
            Ok(EventHandlingStatus::Handled)
        }
    }

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_partition_key(""), 0xcbf29ce484222325);
        assert_eq!(hash_partition_key("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn zero_partitions_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        assert_eq!(
            PartitioningFilter::new(0, PartitionBy::stream()).err(),
            Some(PartitioningError::ZeroPartitions)
        );
        assert_eq!(
            PartitioningFilter::with_capacity(2, PartitionBy::stream(), 0).err(),
            Some(PartitioningError::ZeroCapacity)
        );
    }

    #[test]
    fn requires_runtime() {
        assert_eq!(
            PartitioningFilter::new(2, PartitionBy::stream()).err(),
            Some(PartitioningError::NoRuntime)
        );
    }

    proptest! {
        #[test]
        fn same_key_same_lane(key in ".*", count in 1usize..64) {
            let a = lane_for(hash_partition_key(&key), count);
            let b = lane_for(hash_partition_key(key.clone()), count);
            prop_assert_eq!(a, b);
            prop_assert!(a < count);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lanes_preserve_delivery_order() {
        let recorder = LaneRecorder::default();
        let partitioning = PartitioningFilter::new(4, PartitionBy::hash(|ctx| ctx.stream_position() % 4)).unwrap();
        let pipe = ConsumePipe::builder()
            .add_filter(partitioning)
            .build(HandlerDispatch::new().with_handler(recorder.clone()));

        let (tx, mut rx) = ack_channel();
        for position in 0..100 {
            pipe.send(context(&tx, position, "Tick", None)).await;
        }
        drop(tx);

        let mut acked = 0;
        while let Some(ack) = rx.recv().await {
            assert_eq!(ack.status, HandlingStatus::Handled);
            acked += 1;
            if acked == 100 {
                break;
            }
        }

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen.len(), 100);
        for lane in 0..4u64 {
            let positions: Vec<u64> = seen.iter().filter(|(l, _)| *l == lane).map(|(_, p)| *p).collect();
            let expected: Vec<u64> = (0..100).filter(|p| p % 4 == lane).collect();
            assert_eq!(positions, expected, "lane {lane}");
        }
    }

    #[tokio::test]
    async fn partition_key_recorded_on_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        struct Capture(Arc<Mutex<Vec<Option<String>>>>);

        #[async_trait]
        impl EventHandler for Capture {
            fn handler_type(&self) -> &str {
                "capture"
            }

            async fn handle(&self, ctx: &MessageConsumeContext) -> Result<EventHandlingStatus, ConsumeError> {
                let key = ctx
                    .item(ContextKey::PartitionKey)
                    .and_then(ContextItem::as_text)
                    .map(str::to_string);
                self.0.lock().unwrap().push(key);
                Ok(EventHandlingStatus::Handled)
            }
        }

        let pipe = ConsumePipe::builder()
            .add_filter(PartitioningFilter::new(2, PartitionBy::stream()).unwrap())
            .build(HandlerDispatch::new().with_handler(Capture(sink)));

        let (tx, mut rx) = ack_channel();
        pipe.send(context(&tx, 0, "Tick", None)).await;
        rx.recv().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some("s".to_string())]);
    }

    #[tokio::test]
    async fn full_lane_blocks_the_sender() {
        let gate = Arc::new(Semaphore::new(0));
        let pipe = ConsumePipe::builder()
            .add_filter(PartitioningFilter::with_capacity(1, PartitionBy::stream(), 1).unwrap())
            .build(HandlerDispatch::new().with_handler(Gate(Arc::clone(&gate))));

        let (tx, mut rx) = ack_channel();
        // First message occupies the worker, second fills the queue.
        pipe.send(context(&tx, 0, "Tick", None)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipe.send(context(&tx, 1, "Tick", None)).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), pipe.send(context(&tx, 2, "Tick", None))).await;
        assert!(blocked.is_err(), "third send should wait for lane capacity");

        gate.add_permits(3);
        pipe.send(context(&tx, 3, "Tick", None)).await;

        // The abandoned third send drops its context, which acks it as ignored.
        let mut handled = Vec::new();
        let mut ignored = Vec::new();
        while handled.len() + ignored.len() < 4 {
            let ack = rx.recv().await.unwrap();
            match ack.status {
                HandlingStatus::Handled => handled.push(ack.position),
                _ => ignored.push(ack.position),
            }
        }
        assert_eq!(handled, vec![0, 1, 3]);
        assert_eq!(ignored, vec![2]);
    }
}
