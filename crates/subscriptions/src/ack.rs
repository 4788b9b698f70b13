//! Acknowledgements: how the engine learns that a message is done.
//!
//! Every context owns an [`Acknowledger`] bound to the message's checkpoint
//! position. Whichever task ends up dropping the context (the end of the
//! pipe, a short-circuiting filter, a partition lane) reports the final
//! [`HandlingStatus`] exactly once.

use tokio::sync::mpsc;

use crate::error::ConsumeError;

/// Outcome of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlingStatus {
    /// Still travelling through the pipe.
    Pending,
    /// At least one handler processed the message.
    Handled,
    /// Nothing was interested in the message.
    Ignored,
    /// Processing failed.
    Failed(ConsumeError),
}

impl HandlingStatus {
    /// Combine two statuses; failure wins over handled, handled over ignored.
    pub fn merge(self, other: HandlingStatus) -> HandlingStatus {
        use HandlingStatus::*;
        match (self, other) {
            (Failed(e), _) | (_, Failed(e)) => Failed(e),
            (Handled, _) | (_, Handled) => Handled,
            (Ignored, _) | (_, Ignored) => Ignored,
            (Pending, Pending) => Pending,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, HandlingStatus::Failed(_))
    }
}

/// Completion notice delivered to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub position: u64,
    pub status: HandlingStatus,
}

pub type AckReceiver = mpsc::UnboundedReceiver<Ack>;

/// Sender side handed to each context; one channel per subscribe attempt.
#[derive(Debug, Clone)]
pub struct AckSender(mpsc::UnboundedSender<Ack>);

pub fn ack_channel() -> (AckSender, AckReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AckSender(tx), rx)
}

/// Reports a context's final status when dropped.
#[derive(Debug)]
pub struct Acknowledger {
    position: u64,
    status: HandlingStatus,
    tx: Option<mpsc::UnboundedSender<Ack>>,
}

impl Acknowledger {
    pub fn new(position: u64, sender: &AckSender) -> Self {
        Self {
            position,
            status: HandlingStatus::Pending,
            tx: Some(sender.0.clone()),
        }
    }

    /// An acknowledger nobody listens to.
    pub fn detached(position: u64) -> Self {
        Self {
            position,
            status: HandlingStatus::Pending,
            tx: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn status(&self) -> &HandlingStatus {
        &self.status
    }

    pub(crate) fn record(&mut self, status: HandlingStatus) {
        let current = std::mem::replace(&mut self.status, HandlingStatus::Pending);
        self.status = current.merge(status);
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let status = match std::mem::replace(&mut self.status, HandlingStatus::Pending) {
            HandlingStatus::Pending if std::thread::panicking() => HandlingStatus::Failed(
                ConsumeError::handler("pipe", "unknown", "message processing panicked"),
            ),
            HandlingStatus::Pending => HandlingStatus::Ignored,
            other => other,
        };

        // The engine may already be gone (stopped); nothing left to notify.
        let _ = tx.send(Ack {
            position: self.position,
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_failure_then_handled() {
        let failed = HandlingStatus::Failed(ConsumeError::Cancelled);
        assert_eq!(HandlingStatus::Handled.merge(failed.clone()), failed);
        assert_eq!(HandlingStatus::Ignored.merge(HandlingStatus::Handled), HandlingStatus::Handled);
        assert_eq!(HandlingStatus::Pending.merge(HandlingStatus::Ignored), HandlingStatus::Ignored);
    }

    #[test]
    fn drop_reports_exactly_once() {
        let (tx, mut rx) = ack_channel();
        {
            let mut ack = Acknowledger::new(7, &tx);
            ack.record(HandlingStatus::Handled);
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            Ack {
                position: 7,
                status: HandlingStatus::Handled
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn untouched_context_is_ignored() {
        let (tx, mut rx) = ack_channel();
        drop(Acknowledger::new(3, &tx));
        assert_eq!(rx.try_recv().unwrap().status, HandlingStatus::Ignored);
    }
}
