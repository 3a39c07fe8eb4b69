//! Queue notifications and listener plumbing.

use tokio::sync::broadcast;

use crate::types::OperationId;

/// Events emitted synchronously by the operation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A new operation was enqueued.
    OperationAdded {
        /// New operation id.
        id: OperationId,
        /// Its operation type.
        op_type: String,
    },
    /// An operation was confirmed delivered.
    OperationSynced {
        /// Synced operation id.
        id: OperationId,
    },
    /// An operation exhausted its retries.
    OperationFailed {
        /// Failed operation id.
        id: OperationId,
        /// Last error reported by the transport.
        error: String,
    },
    /// A low-priority operation was dropped to make room.
    OperationEvicted {
        /// Evicted operation id.
        id: OperationId,
    },
    /// No pending or syncing work remains.
    QueueEmpty,
}

/// Receives queue events in registration order.
pub trait QueueListener: Send {
    /// Called at the point of the state change.
    fn on_event(&mut self, event: &QueueEvent);
}

impl<F> QueueListener for F
where
    F: FnMut(&QueueEvent) + Send,
{
    fn on_event(&mut self, event: &QueueEvent) {
        self(event)
    }
}

/// Forwards queue events into a tokio broadcast channel.
///
/// Send errors (no live receivers) are ignored.
pub struct BroadcastListener {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastListener {
    /// Creates a listener and its channel with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<QueueEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Opens another receiver on the same channel.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl QueueListener for BroadcastListener {
    fn on_event(&mut self, event: &QueueEvent) {
        let _ = self.tx.send(event.clone());
    }
}
