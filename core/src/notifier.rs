//! Fast-path notifier (C9): an in-process hint that wakes the relay
//! immediately after a transaction that inserted an outbox row commits,
//! instead of waiting for the next sweep tick.
//!
//! Modeled as a per-transaction list of after-commit callbacks (here: just
//! outbox row ids) flushed to a shared `tokio::sync::mpsc` channel once the
//! transaction commits, per spec §9's "Fast-path after-commit hook" design
//! note. No correctness depends on this channel ever delivering anything —
//! it is a latency optimization over the sweep loop.

use tokio::sync::mpsc;

/// Collects outbox row ids inserted during the lifetime of one DB
/// transaction. Call [`TxContext::flush`] after `tx.commit()` succeeds —
/// never before, since a rolled-back transaction must not notify anyone.
#[derive(Debug, Default)]
pub struct TxContext {
    pending_notifications: Vec<i64>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after_commit_notify(&mut self, outbox_id: i64) {
        self.pending_notifications.push(outbox_id);
    }

    /// Send all queued notifications to the relay's fast-path channel.
    /// Only call this after the owning transaction has committed.
    pub fn flush(self, notifier: &FastPathNotifier) {
        for id in self.pending_notifications {
            notifier.notify(id);
        }
    }
}

/// Process-local concurrent queue the relay drains for fast-path claims.
#[derive(Clone)]
pub struct FastPathNotifier {
    sender: mpsc::UnboundedSender<i64>,
}

pub struct FastPathReceiver {
    receiver: mpsc::UnboundedReceiver<i64>,
}

impl FastPathNotifier {
    pub fn channel() -> (Self, FastPathReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, FastPathReceiver { receiver })
    }

    /// Best-effort: if the relay's receiver has been dropped there is
    /// nothing to wake, and the next sweep tick will pick the row up anyway.
    pub fn notify(&self, outbox_id: i64) {
        let _ = self.sender.send(outbox_id);
    }
}

impl FastPathReceiver {
    pub async fn recv(&mut self) -> Option<i64> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_delivers_all_pending_ids_in_order() {
        let (notifier, mut receiver) = FastPathNotifier::channel();
        let mut tx = TxContext::new();
        tx.after_commit_notify(1);
        tx.after_commit_notify(2);
        tx.flush(&notifier);

        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_panic_on_notify() {
        let (notifier, receiver) = FastPathNotifier::channel();
        drop(receiver);
        notifier.notify(42);
    }
}
