//! The transport collaborator the coordinator posts through.
//!
//! Implement [`ServerConnection`] on top of whatever client talks to the
//! backend (gRPC channel, WebSocket, in-process bus). The coordinator
//! receives the connection explicitly and never looks it up globally.
//!
//! # Example Implementation
//!
//! ```ignore
//! use consequence::{Acknowledgement, EventKey, EventSink, PostError, ServerConnection,
//!     SubscribeError, TransportSubscription};
//!
//! struct GrpcConnection { client: CommandServiceClient, events: EventStream }
//!
//! #[async_trait]
//! impl ServerConnection for GrpcConnection {
//!     type Command = proto::Command;
//!
//!     fn subscribe(
//!         &self,
//!         key: &EventKey,
//!         sink: EventSink,
//!     ) -> Result<Box<dyn TransportSubscription>, SubscribeError> {
//!         let handle = self.events.observe(key, move |envelope| { sink.deliver(envelope); })?;
//!         Ok(Box::new(handle))
//!     }
//!
//!     async fn post(&self, command: proto::Command) -> Result<Acknowledgement, PostError> {
//!         match self.client.post(command).await {
//!             Ok(ack) if ack.is_ok() => Ok(Acknowledgement::now()),
//!             Ok(ack) => Err(ServerError::new(ack.message).into()),
//!             Err(status) => Err(NetworkError::new(status.to_string()).into()),
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{Command, EventKey};
use crate::error::{PostError, SubscribeError};
use crate::subscription::EventSink;

/// Server acknowledgement of a posted command.
///
/// Acknowledgement only means the server accepted the command for
/// processing; its consequences arrive later as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    /// When the acknowledgement was received.
    pub acknowledged_at: DateTime<Utc>,
}

impl Acknowledgement {
    /// Acknowledgement received now.
    pub fn now() -> Self {
        Self {
            acknowledged_at: Utc::now(),
        }
    }
}

/// Transport-level registration of interest, released when the
/// subscription ends.
pub trait TransportSubscription: Send + Sync {
    /// Stop delivering events to this subscription. Called at most once.
    fn unsubscribe(&self);
}

/// Client connection to the backend.
///
/// Events must be delivered to each [`EventSink`] asynchronously and
/// independently of [`post`](Self::post) completing; an event may even
/// arrive before `post` returns.
#[async_trait]
pub trait ServerConnection: Send + Sync + 'static {
    /// Command type this connection posts.
    type Command: Command;

    /// Register interest in events matching `key`.
    ///
    /// Must fail immediately if the transport cannot register interest.
    /// Matching events are handed to [`EventSink::deliver`]; loss of
    /// connectivity is reported with [`EventSink::fail`].
    fn subscribe(
        &self,
        key: &EventKey,
        sink: EventSink,
    ) -> Result<Box<dyn TransportSubscription>, SubscribeError>;

    /// Post a command and wait for the server to acknowledge it.
    async fn post(&self, command: Self::Command) -> Result<Acknowledgement, PostError>;
}

/// Object-safe view of the subscribe half of a connection.
pub(crate) trait Subscriber: Send + Sync {
    fn subscribe_sink(
        &self,
        key: &EventKey,
        sink: EventSink,
    ) -> Result<Box<dyn TransportSubscription>, SubscribeError>;
}

impl<C: ServerConnection> Subscriber for C {
    fn subscribe_sink(
        &self,
        key: &EventKey,
        sink: EventSink,
    ) -> Result<Box<dyn TransportSubscription>, SubscribeError> {
        ServerConnection::subscribe(self, key, sink)
    }
}
