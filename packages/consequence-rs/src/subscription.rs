//! Single-shot event subscriptions and the session gate they report to.
//!
//! # State machine
//!
//! ```text
//!            deliver()            ┌───────┐
//!        ┌──────────────────────► │ Fired │
//!        │                        └───────┘
//! ┌──────┴─┐  countdown elapsed   ┌──────────┐
//! │ Active ├────────────────────► │ TimedOut │
//! └──────┬─┘                      └──────────┘
//!        │   cancel()             ┌───────────┐
//!        └──────────────────────► │ Cancelled │
//!                                 └───────────┘
//! ```
//!
//! Every transition out of `Active` is a single compare-and-swap on the
//! subscription's state word, so exactly one of delivery, expiry and
//! cancellation wins; the others are no-ops.
//!
//! # Session gate
//!
//! All subscriptions of one session share a [`SessionGate`]. A subscription
//! that wins its own race must also claim the gate before it reports to the
//! coordinator. Losing the gate means another subscription (or a transport
//! failure) already decided the session; the loser ends `Cancelled` and its
//! handler never runs.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::TransportSubscription;
use crate::core::{EventEnvelope, EventKey, EventKind, SubscriptionId};
use crate::error::{NetworkError, SubscribeError};
use crate::racer::TimeoutRacer;
use crate::scope::{EventHandler, TimeoutHandler};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state of an [`EventSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubscriptionState {
    /// Waiting for a matching event.
    Active = 0,
    /// A matching event was delivered.
    Fired = 1,
    /// The countdown elapsed first.
    TimedOut = 2,
    /// Cancelled explicitly, in bulk, or by losing the session race.
    Cancelled = 3,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Active,
            1 => SubscriptionState::Fired,
            2 => SubscriptionState::TimedOut,
            _ => SubscriptionState::Cancelled,
        }
    }

    /// Returns true for every state except `Active`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubscriptionState::Active)
    }
}

/// What a subscription reports to the coordinator.
#[derive(Debug)]
pub(crate) enum Resolution {
    Fired {
        subscription: SubscriptionId,
        envelope: EventEnvelope,
    },
    TimedOut {
        subscription: SubscriptionId,
    },
    NetworkError(NetworkError),
    /// Informational: the subscription left `Active` without deciding anything.
    Cancelled { subscription: SubscriptionId },
}

/// First-resolver-wins arbiter shared by every subscription of a session.
pub(crate) struct SessionGate {
    settled: AtomicBool,
    sender: mpsc::UnboundedSender<Resolution>,
}

impl SessionGate {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Resolution>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let gate = Arc::new(Self {
            settled: AtomicBool::new(false),
            sender,
        });
        (gate, receiver)
    }

    /// Claim the session. Only the first caller gets `true`.
    pub(crate) fn try_settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub(crate) fn report(&self, resolution: Resolution) {
        // The receiver is gone once the session has finished.
        let _ = self.sender.send(resolution);
    }
}

struct SubscriptionInner {
    id: SubscriptionId,
    key: EventKey,
    kind: EventKind,
    state: AtomicU8,
    gate: Arc<SessionGate>,
    racer: TimeoutRacer,
    armed: AtomicBool,
    timeout: Mutex<Option<Duration>>,
    handler: Mutex<Option<EventHandler>>,
    timeout_handler: Mutex<Option<TimeoutHandler>>,
    transport: Mutex<Option<Box<dyn TransportSubscription>>>,
    subscribe_error: Mutex<Option<SubscribeError>>,
}

impl SubscriptionInner {
    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the countdown and the transport-level interest.
    fn finish(&self) {
        self.racer.cancel();
        let transport = lock(&self.transport).take();
        if let Some(transport) = transport {
            transport.unsubscribe();
        }
    }

    fn fire(&self, envelope: EventEnvelope) -> bool {
        if envelope.key != self.key {
            trace!(subscription = %self.id, key = %self.key, got = %envelope.key, "ignoring event for another key");
            return false;
        }
        if !self.transition(SubscriptionState::Active, SubscriptionState::Fired) {
            trace!(subscription = %self.id, key = %self.key, state = ?self.state(), "ignoring event for terminal subscription");
            return false;
        }
        self.finish();

        if self.gate.try_settle() {
            debug!(subscription = %self.id, key = %self.key, kind = %self.kind, "subscription fired");
            self.gate.report(Resolution::Fired {
                subscription: self.id,
                envelope,
            });
            true
        } else {
            self.transition(SubscriptionState::Fired, SubscriptionState::Cancelled);
            debug!(subscription = %self.id, key = %self.key, "event arrived after session was decided");
            false
        }
    }

    fn expire(&self) {
        if !self.transition(SubscriptionState::Active, SubscriptionState::TimedOut) {
            return;
        }
        self.finish();

        if self.gate.try_settle() {
            debug!(subscription = %self.id, key = %self.key, "subscription timed out");
            self.gate.report(Resolution::TimedOut {
                subscription: self.id,
            });
        } else {
            self.transition(SubscriptionState::TimedOut, SubscriptionState::Cancelled);
        }
    }

    fn cancel(&self) -> bool {
        if !self.transition(SubscriptionState::Active, SubscriptionState::Cancelled) {
            return false;
        }
        self.finish();
        self.gate.report(Resolution::Cancelled {
            subscription: self.id,
        });
        true
    }

    fn fail(&self, error: NetworkError) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        if self.gate.try_settle() {
            warn!(subscription = %self.id, key = %self.key, error = %error, "transport failed while awaiting event");
            self.gate.report(Resolution::NetworkError(error));
            true
        } else {
            false
        }
    }
}

/// A live, single-shot registration of interest in one event.
///
/// Created by [`ConsequenceScope::on_event`](crate::ConsequenceScope::on_event)
/// or [`ConsequenceScope::on_rejection`](crate::ConsequenceScope::on_rejection).
/// Cloning yields another handle to the same subscription.
///
/// # Example
///
/// ```ignore
/// coordinator.run(command, |scope| {
///     scope
///         .on_event(EventKey::new("TaskCreated", "task_id", id.to_string()))
///         .with_timeout(Duration::from_secs(5), |key| async move {
///             warn!(%key, "task was not created in time");
///             Ok(())
///         })
///         .handled_as(|envelope| async move {
///             let created = envelope.downcast_ref::<TaskCreated>();
///             Ok(())
///         });
/// }).await?;
/// ```
#[derive(Clone)]
pub struct EventSubscription {
    inner: Arc<SubscriptionInner>,
}

impl EventSubscription {
    pub(crate) fn new(key: EventKey, kind: EventKind, gate: Arc<SessionGate>) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id: SubscriptionId::new(),
                key,
                kind,
                state: AtomicU8::new(SubscriptionState::Active as u8),
                gate,
                racer: TimeoutRacer::new(),
                armed: AtomicBool::new(false),
                timeout: Mutex::new(None),
                handler: Mutex::new(None),
                timeout_handler: Mutex::new(None),
                transport: Mutex::new(None),
                subscribe_error: Mutex::new(None),
            }),
        }
    }

    /// Unique ID of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    /// Key this subscription matches.
    pub fn key(&self) -> &EventKey {
        &self.inner.key
    }

    /// Whether this subscription waits for an event or a rejection.
    pub fn kind(&self) -> EventKind {
        self.inner.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    /// Returns true while the subscription is still waiting.
    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// The transport error if the subscription could not be registered.
    pub fn subscribe_error(&self) -> Option<SubscribeError> {
        lock(&self.inner.subscribe_error).clone()
    }

    /// Cancel the subscription.
    ///
    /// Idempotent. Returns true if a live subscription was cancelled, false
    /// if it had already fired, timed out or been cancelled.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Arm (or re-arm) the countdown for this subscription.
    ///
    /// If the countdown elapses while the subscription is still active, it
    /// becomes `TimedOut`, is released at the transport level, and
    /// `on_timeout` runs once as the session's resolution. Calling this again
    /// before expiry discards the previous countdown and handler.
    ///
    /// Countdowns start once the command has been acknowledged; calling this
    /// afterwards restarts the clock immediately.
    pub fn with_timeout<F, Fut>(&self, timeout: Duration, on_timeout: F) -> &Self
    where
        F: FnOnce(EventKey) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        *lock(&self.inner.timeout_handler) = Some(crate::scope::boxed_with_arg(on_timeout));
        self.timeout_after(timeout)
    }

    /// Override the countdown duration, keeping the timeout handler as is.
    ///
    /// Without a per-subscription handler the scope-level default timeout
    /// handler runs on expiry.
    pub fn timeout_after(&self, timeout: Duration) -> &Self {
        *lock(&self.inner.timeout) = Some(timeout);
        if self.inner.armed.load(Ordering::Acquire) {
            self.start_countdown(timeout);
        }
        self
    }

    /// Handle the matching event with `handler` instead of the scope default.
    ///
    /// An override replaces the scope-level handler entirely; the default
    /// does not also run.
    pub fn handled_as<F, Fut>(&self, handler: F) -> &Self
    where
        F: FnOnce(EventEnvelope) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        *lock(&self.inner.handler) = Some(crate::scope::boxed_with_arg(handler));
        self
    }

    /// Entry point the transport uses to deliver and fail this subscription.
    pub(crate) fn sink(&self) -> EventSink {
        EventSink {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn attach_transport(&self, transport: Box<dyn TransportSubscription>) {
        let mut slot = lock(&self.inner.transport);
        if self.state().is_terminal() {
            drop(slot);
            transport.unsubscribe();
        } else {
            *slot = Some(transport);
        }
    }

    pub(crate) fn mark_failed(&self, error: SubscribeError) {
        *lock(&self.inner.subscribe_error) = Some(error);
        if self
            .inner
            .transition(SubscriptionState::Active, SubscriptionState::Cancelled)
        {
            self.inner.finish();
        }
    }

    /// Start the countdown once the command has been acknowledged.
    pub(crate) fn arm(&self, default_timeout: Duration) {
        self.inner.armed.store(true, Ordering::Release);
        let timeout = lock(&self.inner.timeout).unwrap_or(default_timeout);
        self.start_countdown(timeout);
    }

    fn start_countdown(&self, timeout: Duration) {
        if !self.is_active() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.racer.arm(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire();
            }
        });
    }

    pub(crate) fn take_handler(&self) -> Option<EventHandler> {
        lock(&self.inner.handler).take()
    }

    pub(crate) fn take_timeout_handler(&self) -> Option<TimeoutHandler> {
        lock(&self.inner.timeout_handler).take()
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle through which a [`ServerConnection`](crate::ServerConnection)
/// delivers events to one subscription.
///
/// The transport calls [`deliver`](Self::deliver) when an event matching
/// [`key`](Self::key) arrives and [`fail`](Self::fail) when it loses
/// connectivity. Both are safe to call from any thread, any number of times.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SubscriptionInner>,
}

impl EventSink {
    /// Key the subscription is waiting for.
    pub fn key(&self) -> &EventKey {
        &self.inner.key
    }

    /// Returns true while the subscription still accepts an event.
    pub fn is_active(&self) -> bool {
        !self.inner.state().is_terminal()
    }

    /// Deliver a matching event.
    ///
    /// Returns true if this delivery fired the subscription and decided the
    /// session. Events for other keys, and events arriving after the
    /// subscription became terminal, are ignored.
    pub fn deliver(&self, envelope: EventEnvelope) -> bool {
        self.inner.fire(envelope)
    }

    /// Report a transport failure while the subscription is pending.
    ///
    /// Returns true if the failure decided the session.
    pub fn fail(&self, error: NetworkError) -> bool {
        self.inner.fail(error)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscription", &self.inner.id)
            .field("key", &self.inner.key)
            .finish()
    }
}
