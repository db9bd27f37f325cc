//! Core value types for command-consequence coordination.
//!
//! # Overview
//!
//! A caller posts a [`Command`] (intent) and declares which events it is
//! willing to wait for. Events are facts the server emits after processing;
//! each one is addressed by an [`EventKey`] and arrives wrapped in an
//! [`EventEnvelope`]. An event is either a domain effect or a rejection
//! ([`EventKind`]), which decides whether the session that observes it ends
//! positively or negatively.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An intent posted to the server, processed asynchronously.
///
/// Commands are opaque to the coordinator: they are passed by value to
/// [`ServerConnection::post`](crate::ServerConnection::post) and never
/// inspected beyond their type name, which is only used for logs.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct CreateTask {
///     task_id: Uuid,
///     title: String,
/// }
///
/// impl Command for CreateTask {}
/// ```
pub trait Command: Any + Send + Sync + 'static {
    /// Human-readable command type name.
    fn command_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A fact emitted by the server.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Clone + Send + Sync + 'static`. You don't need to implement it manually.
pub trait Event: Any + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Event for T {}

/// Whether a subscribed event signals success or a domain-level refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The command had its domain effect.
    Event,
    /// The server refused the command.
    Rejection,
}

impl EventKind {
    /// Returns true if this is a rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, EventKind::Rejection)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Event => write!(f, "event"),
            EventKind::Rejection => write!(f, "rejection"),
        }
    }
}

/// Address used to match an incoming event to subscriptions.
///
/// A key is the triple (event type, correlating field, field value). Two
/// subscriptions with equal keys are independent: both receive a matching
/// event.
///
/// # Example
///
/// ```ignore
/// // "TaskCreated whose task_id equals the id we are about to post"
/// let key = EventKey::new("TaskCreated", "task_id", task_id.to_string());
///
/// // Same, letting serde render a non-string id
/// let key = EventKey::for_value("TaskCreated", "task_id", &task_id)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Event type discriminator.
    pub event_type: String,
    /// Name of the field that correlates the event with the command.
    pub field: String,
    /// Expected value of that field.
    pub value: String,
}

impl EventKey {
    /// Create a key from its three parts.
    pub fn new(
        event_type: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a key whose value is the canonical JSON rendering of `value`.
    ///
    /// JSON strings are used unquoted so that `for_value(.., &"abc")` and
    /// `new(.., "abc")` produce equal keys.
    pub fn for_value<V>(
        event_type: impl Into<String>,
        field: impl Into<String>,
        value: &V,
    ) -> Result<Self, serde_json::Error>
    where
        V: Serialize + ?Sized,
    {
        let value = match serde_json::to_value(value)? {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Self::new(event_type, field, value))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}={}]", self.event_type, self.field, self.value)
    }
}

/// Identifier of one subscription, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one coordination session (one posted command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope wrapping a delivered event with the key it was matched on.
///
/// The payload is type-erased; handlers recover the concrete event with
/// [`EventEnvelope::downcast_ref`].
#[derive(Clone)]
pub struct EventEnvelope {
    /// Key the event was published under.
    pub key: EventKey,
    /// Type ID of the payload event.
    pub type_id: TypeId,
    /// The actual event payload.
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl EventEnvelope {
    /// Create a new event envelope.
    pub fn new<E: Event>(key: EventKey, event: E) -> Self {
        Self {
            key,
            type_id: TypeId::of::<E>(),
            payload: Arc::new(event),
        }
    }

    /// Downcast the payload to a concrete event type.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref()
    }

    /// Returns true if the payload is of type `E`.
    pub fn is<E: Any>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("key", &self.key)
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}
