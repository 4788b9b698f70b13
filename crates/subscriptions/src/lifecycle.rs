//! Subscription lifecycle states and drop classification.

use core::fmt;

use serde::Serialize;

/// `Stopped → Subscribing → Live → Dropped → Resubscribing → Live`
///
/// `Dropped` is final when the drop is not recoverable or its checkpoint could
/// not be stored: the task ends and the state stays `Dropped(reason)`.
/// `Stopped` is only reached through a stop or a failed first subscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Stopped,
    Subscribing,
    Live,
    Dropped(DropReason),
    Resubscribing,
}

impl SubscriptionState {
    pub fn is_live(self) -> bool {
        matches!(self, SubscriptionState::Live)
    }
}

/// Why a subscription stopped receiving events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Transport to the store was lost.
    ConnectionLost,
    /// The store shut down.
    ServerStopped,
    /// The pipeline failed fatally.
    SubscriberError,
}

impl DropReason {
    /// Connection-class drops resubscribe automatically; the rest need an
    /// explicit restart by the owning host.
    pub fn is_recoverable(self) -> bool {
        matches!(self, DropReason::ConnectionLost)
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::ConnectionLost => f.write_str("connection lost"),
            DropReason::ServerStopped => f.write_str("server stopped"),
            DropReason::SubscriberError => f.write_str("subscriber error"),
        }
    }
}
