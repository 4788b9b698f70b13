//! Catch-up subscriptions driven from an [`EventStore`](crate::event_store::EventStore).
//!
//! `Stopped → Subscribing → Live ⇄ Dropped → (Resubscribing → Live | Stopped)`

pub mod engine;
pub mod error;
pub mod handle;
pub mod options;

pub use engine::StreamSubscription;
pub use error::SubscriptionError;
pub use handle::{SubscriptionGap, SubscriptionHandle, SubscriptionStatus};
pub use options::StreamSubscriptionOptions;
