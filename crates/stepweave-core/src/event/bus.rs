//! Broadcast event bus for distributing `FlowEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so emitting never blocks or fails a run.

use stepweave_types::event::FlowEvent;
use tokio::sync::broadcast;

/// Sink for run lifecycle events.
///
/// Implementations must not block; the orchestrator calls `emit` inline on
/// the execution path.
pub trait NotificationEmitter: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

/// Multi-consumer event bus for flow runs.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }
}

impl NotificationEmitter for EventBus {
    fn emit(&self, event: FlowEvent) {
        self.publish(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
