//! In-memory [`ServerConnection`] for tests, demos and offline development.
//!
//! Events are published on an [`EventBus`]; every subscription gets its own
//! listener task that hands the first envelope with a matching key to its
//! [`EventSink`]. Post results, subscribe refusals and connection loss can be
//! scripted ahead of time.
//!
//! # Example
//!
//! ```ignore
//! let connection = Arc::new(InMemoryConnection::<CreateTask>::new());
//! connection.react_with(Reaction::emit(
//!     Duration::from_millis(50),
//!     EventKey::new("TaskCreated", "task_id", "1"),
//!     TaskCreated { task_id: 1 },
//! ));
//!
//! let coordinator = CommandCoordinator::new(connection.clone());
//! let positive = coordinator
//!     .post(CreateTask { task_id: 1 }, |scope| {
//!         scope.on_event(EventKey::new("TaskCreated", "task_id", "1"));
//!     })
//!     .await?;
//!
//! assert!(positive);
//! assert_eq!(connection.post_count(), 1);
//! ```

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bus::EventBus;
use crate::connection::{Acknowledgement, ServerConnection, TransportSubscription};
use crate::core::{Command, Event, EventEnvelope, EventKey};
use crate::error::{NetworkError, PostError, SubscribeError};
use crate::subscription::{lock, EventSink};

/// Something the simulated server does after acknowledging a command.
#[derive(Debug, Clone)]
pub enum Reaction {
    /// Emit an event `after` the acknowledgement.
    Emit {
        after: Duration,
        envelope: EventEnvelope,
    },
    /// Drop the connection `after` the acknowledgement.
    Disconnect { after: Duration, error: NetworkError },
}

impl Reaction {
    pub fn emit<E: Event>(after: Duration, key: EventKey, event: E) -> Self {
        Reaction::Emit {
            after,
            envelope: EventEnvelope::new(key, event),
        }
    }

    pub fn disconnect(after: Duration, error: NetworkError) -> Self {
        Reaction::Disconnect { after, error }
    }
}

struct Shared {
    bus: EventBus,
    sinks: DashMap<u64, EventSink>,
    connected: AtomicBool,
}

impl Shared {
    fn disconnect(&self, error: &NetworkError) -> usize {
        self.connected.store(false, Ordering::Release);

        // Collect first: failing a sink may unsubscribe and touch the map.
        let sinks: Vec<EventSink> = self.sinks.iter().map(|entry| entry.value().clone()).collect();
        let decided = sinks.iter().filter(|sink| sink.fail(error.clone())).count();
        warn!(live = sinks.len(), decided, error = %error, "in-memory connection dropped");
        decided
    }
}

/// Transport-level subscription of one listener task.
struct MemorySubscription {
    id: u64,
    token: CancellationToken,
    shared: Arc<Shared>,
}

impl TransportSubscription for MemorySubscription {
    fn unsubscribe(&self) {
        self.token.cancel();
        self.shared.sinks.remove(&self.id);
    }
}

/// In-process stand-in for a backend connection.
///
/// Posting acknowledges immediately (after the optional latency) unless a
/// failure was scripted with [`fail_next_post`](Self::fail_next_post).
pub struct InMemoryConnection<C> {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    posted: Mutex<Vec<C>>,
    post_failures: Mutex<VecDeque<PostError>>,
    reactions: Mutex<Vec<Reaction>>,
    refused: DashMap<EventKey, String>,
    post_latency: Mutex<Option<Duration>>,
    _command: PhantomData<fn(C)>,
}

impl<C: Command> InMemoryConnection<C> {
    pub fn new() -> Self {
        Self::with_bus(EventBus::new())
    }

    /// Use an existing bus, e.g. one shared with a simulated server.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                sinks: DashMap::new(),
                connected: AtomicBool::new(true),
            }),
            next_id: AtomicU64::new(0),
            posted: Mutex::new(Vec::new()),
            post_failures: Mutex::new(VecDeque::new()),
            reactions: Mutex::new(Vec::new()),
            refused: DashMap::new(),
            post_latency: Mutex::new(None),
            _command: PhantomData,
        }
    }

    /// Bus events are published on.
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Publish an event now. Returns how many listeners saw it.
    pub fn publish<E: Event>(&self, key: EventKey, event: E) -> usize {
        self.shared.bus.emit(key, event)
    }

    /// Fail the next post with `error` instead of acknowledging it.
    ///
    /// Failures queue up; each post consumes one.
    pub fn fail_next_post(&self, error: PostError) {
        lock(&self.post_failures).push_back(error);
    }

    /// Run `reaction` after the next successful post.
    pub fn react_with(&self, reaction: Reaction) {
        lock(&self.reactions).push(reaction);
    }

    /// Refuse every subscription to `key`.
    pub fn refuse_subscriptions_for(&self, key: EventKey, reason: impl Into<String>) {
        self.refused.insert(key, reason.into());
    }

    /// Delay every post by `latency` before it resolves.
    pub fn set_post_latency(&self, latency: Duration) {
        *lock(&self.post_latency) = Some(latency);
    }

    /// Drop the connection: every live subscription is failed and further
    /// posts and subscribes fail until [`reconnect`](Self::reconnect).
    ///
    /// Returns how many sessions this decided.
    pub fn disconnect(&self, error: NetworkError) -> usize {
        self.shared.disconnect(&error)
    }

    pub fn reconnect(&self) {
        self.shared.connected.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of subscriptions still registered at the transport level.
    pub fn live_subscriptions(&self) -> usize {
        self.shared.sinks.len()
    }

    pub fn post_count(&self) -> usize {
        lock(&self.posted).len()
    }

    fn schedule(&self, reaction: Reaction) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match reaction {
                Reaction::Emit { after, envelope } => {
                    tokio::time::sleep(after).await;
                    let key = envelope.key.clone();
                    let receivers = shared.bus.emit_envelope(envelope);
                    debug!(%key, receivers, "in-memory server emitted event");
                }
                Reaction::Disconnect { after, error } => {
                    tokio::time::sleep(after).await;
                    shared.disconnect(&error);
                }
            }
        });
    }
}

impl<C: Command + Clone> InMemoryConnection<C> {
    /// Every command posted so far, in order.
    pub fn posted(&self) -> Vec<C> {
        lock(&self.posted).clone()
    }
}

impl<C: Command> Default for InMemoryConnection<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for InMemoryConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnection")
            .field("connected", &self.shared.connected.load(Ordering::Acquire))
            .field("live_subscriptions", &self.shared.sinks.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: Command> ServerConnection for InMemoryConnection<C> {
    type Command = C;

    fn subscribe(
        &self,
        key: &EventKey,
        sink: EventSink,
    ) -> Result<Box<dyn TransportSubscription>, SubscribeError> {
        if let Some(reason) = self.refused.get(key) {
            return Err(SubscribeError::Refused {
                key: key.clone(),
                reason: reason.value().clone(),
            });
        }
        if !self.is_connected() {
            return Err(SubscribeError::Disconnected {
                key: key.clone(),
                source: NetworkError::new("in-memory connection is down"),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        // Subscribe before spawning so nothing emitted from now on is missed.
        let mut receiver = self.shared.bus.subscribe();
        self.shared.sinks.insert(id, sink.clone());

        let listener_token = token.clone();
        let shared = self.shared.clone();
        let key = key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = listener_token.cancelled() => break,

                    received = receiver.recv() => match received {
                        Ok(envelope) if envelope.key == key => {
                            trace!(%key, "delivering event");
                            sink.deliver(envelope);
                            break;
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%key, skipped, "listener lagged, events may be missed");
                        }
                        Err(RecvError::Closed) => {
                            sink.fail(NetworkError::new("event bus closed"));
                            break;
                        }
                    },
                }
            }
            shared.sinks.remove(&id);
        });

        Ok(Box::new(MemorySubscription {
            id,
            token,
            shared: self.shared.clone(),
        }))
    }

    async fn post(&self, command: C) -> Result<Acknowledgement, PostError> {
        let latency = *lock(&self.post_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        debug!(command = command.command_type(), "in-memory post");
        lock(&self.posted).push(command);

        if !self.is_connected() {
            return Err(NetworkError::new("in-memory connection is down").into());
        }
        let scripted = lock(&self.post_failures).pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        let reactions = std::mem::take(&mut *lock(&self.reactions));
        for reaction in reactions {
            self.schedule(reaction);
        }
        Ok(Acknowledgement::now())
    }
}
