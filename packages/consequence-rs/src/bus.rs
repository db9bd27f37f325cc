//! Keyed broadcast bus for server events.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: Slow receivers may miss events
//! - **In-memory only**: Events are not persisted
//! - **No replay**: Receivers only see events emitted after they subscribed;
//!   lagged receivers get `RecvError::Lagged`

use tokio::sync::broadcast;

use crate::core::{Event, EventEnvelope, EventKey};

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel carrying keyed [`EventEnvelope`]s.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
/// let mut receiver = bus.subscribe();
///
/// bus.emit(EventKey::new("TaskCreated", "task_id", "42"), TaskCreated { task_id: 42 });
///
/// let envelope = receiver.recv().await?;
/// if let Some(created) = envelope.downcast_ref::<TaskCreated>() {
///     println!("created {}", created.task_id);
/// }
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit `event` under `key` to all current subscribers.
    ///
    /// Returns the number of receivers that received the event.
    pub fn emit<E: Event>(&self, key: EventKey, event: E) -> usize {
        self.emit_envelope(EventEnvelope::new(key, event))
    }

    /// Emit an already wrapped envelope.
    pub fn emit_envelope(&self, envelope: EventEnvelope) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to every envelope emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
