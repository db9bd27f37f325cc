//! Per-session set of subscriptions with bulk cancellation.
//!
//! The [`SubscriptionRegistry`] is the single owner of every
//! [`EventSubscription`] created in one session. Callers that hold on to the
//! registry (for example a dialog that posted the command) can cancel the
//! whole session with [`cancel_all`](SubscriptionRegistry::cancel_all); the
//! coordinator observes the cancellation and resolves the session as
//! cancelled without running any outcome handler.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{EventKey, SessionId, SubscriptionId};
use crate::error::SubscribeError;
use crate::subscription::{EventSubscription, Resolution, SessionGate, SubscriptionState};

struct RegistryInner {
    session: SessionId,
    subscriptions: DashMap<SubscriptionId, EventSubscription>,
    gate: Arc<SessionGate>,
    cancellation: CancellationToken,
}

/// Unordered set of the live subscriptions of one session.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(
        cancellation: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Resolution>) {
        let (gate, resolutions) = SessionGate::new();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                session: SessionId::new(),
                subscriptions: DashMap::new(),
                gate,
                cancellation,
            }),
        };
        (registry, resolutions)
    }

    /// Session this registry belongs to.
    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    /// Track a subscription.
    ///
    /// Registering into a session that has already been decided cancels the
    /// subscription right away.
    pub fn register(&self, subscription: EventSubscription) {
        let settled = self.inner.gate.is_settled();
        self.inner
            .subscriptions
            .insert(subscription.id(), subscription.clone());
        if settled {
            subscription.cancel();
        }
    }

    /// Number of tracked subscriptions, whatever their state.
    pub fn len(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Returns true if no subscription was registered.
    pub fn is_empty(&self) -> bool {
        self.inner.subscriptions.is_empty()
    }

    /// Look up a subscription by ID.
    pub fn get(&self, id: SubscriptionId) -> Option<EventSubscription> {
        self.inner.subscriptions.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns true iff every tracked subscription is still active.
    ///
    /// Checked before posting: a subscription that failed at the transport
    /// level is already terminal.
    pub fn all_active(&self) -> bool {
        self.inner
            .subscriptions
            .iter()
            .all(|entry| entry.value().is_active())
    }

    /// Number of subscriptions still waiting.
    pub fn active_count(&self) -> usize {
        self.inner
            .subscriptions
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Snapshot of every subscription's key and state.
    pub fn states(&self) -> Vec<(SubscriptionId, EventKey, SubscriptionState)> {
        self.inner
            .subscriptions
            .iter()
            .map(|entry| {
                let sub = entry.value();
                (sub.id(), sub.key().clone(), sub.state())
            })
            .collect()
    }

    /// Cancel the whole session.
    ///
    /// Cancels every subscription still active and signals the coordinator,
    /// which abandons pending hooks and resolves the session as cancelled if
    /// it had not resolved yet. Idempotent; safe to call from any thread and
    /// any number of times. Returns how many live subscriptions were
    /// cancelled by this call.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancellation.cancel();
        self.release()
    }

    /// Returns true once [`cancel_all`](Self::cancel_all) was called or the
    /// caller's cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Settle the session and cancel every subscription still active.
    pub(crate) fn release(&self) -> usize {
        self.inner.gate.try_settle();

        // Snapshot first: cancelling calls into the transport.
        let subscriptions: Vec<EventSubscription> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let cancelled = subscriptions.iter().filter(|sub| sub.cancel()).count();
        if cancelled > 0 {
            debug!(session = %self.inner.session, cancelled, "cancelled remaining subscriptions");
        }
        cancelled
    }

    /// Returns true if every subscription ended without deciding anything.
    pub(crate) fn all_cancelled(&self) -> bool {
        self.inner
            .subscriptions
            .iter()
            .all(|entry| entry.value().state() == SubscriptionState::Cancelled)
    }

    pub(crate) fn first_subscribe_error(&self) -> Option<SubscribeError> {
        self.inner
            .subscriptions
            .iter()
            .find_map(|entry| entry.value().subscribe_error())
    }

    /// Start the countdown of every active subscription.
    pub(crate) fn arm_timeouts(&self, default_timeout: Duration) {
        let subscriptions: Vec<EventSubscription> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for sub in subscriptions {
            sub.arm(default_timeout);
        }
    }

    pub(crate) fn gate(&self) -> Arc<SessionGate> {
        self.inner.gate.clone()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("session", &self.inner.session)
            .field("subscriptions", &self.len())
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventEnvelope, EventKind};

    #[derive(Debug, Clone)]
    struct TaskCreated;

    fn key(n: u32) -> EventKey {
        EventKey::new("TaskCreated", "task_id", n.to_string())
    }

    fn registry_with(n: u32) -> (SubscriptionRegistry, Vec<EventSubscription>) {
        let (registry, _rx) = SubscriptionRegistry::new(CancellationToken::new());
        let subs: Vec<_> = (0..n)
            .map(|i| {
                let sub = EventSubscription::new(key(i), EventKind::Event, registry.gate());
                registry.register(sub.clone());
                sub
            })
            .collect();
        (registry, subs)
    }

    #[test]
    fn test_all_active_on_empty_registry() {
        let (registry, _) = registry_with(0);
        assert!(registry.is_empty());
        assert!(registry.all_active());
    }

    #[test]
    fn test_all_active_detects_terminal_subscription() {
        let (registry, subs) = registry_with(3);
        assert!(registry.all_active());

        subs[1].cancel();
        assert!(!registry.all_active());
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_cancel_all_is_idempotent() {
        let (registry, subs) = registry_with(3);

        assert_eq!(registry.cancel_all(), 3);
        assert_eq!(registry.cancel_all(), 0);
        assert_eq!(registry.cancel_all(), 0);

        assert!(registry.is_cancelled());
        assert!(subs
            .iter()
            .all(|sub| sub.state() == SubscriptionState::Cancelled));
    }

    #[test]
    fn test_cancel_all_skips_terminal_subscriptions() {
        let (registry, subs) = registry_with(3);
        subs[0]
            .sink()
            .deliver(EventEnvelope::new(key(0), TaskCreated));

        assert_eq!(registry.cancel_all(), 2);
        assert_eq!(subs[0].state(), SubscriptionState::Fired);
    }

    #[test]
    fn test_release_blocks_late_deliveries() {
        let (registry, subs) = registry_with(2);
        registry.release();

        assert!(!subs[0].sink().deliver(EventEnvelope::new(key(0), TaskCreated)));
        assert!(registry.all_cancelled());
        // Internal release does not look like external cancellation
        assert!(!registry.is_cancelled());
    }

    #[test]
    fn test_register_after_release_cancels() {
        let (registry, _) = registry_with(0);
        registry.release();

        let late = EventSubscription::new(key(9), EventKind::Event, registry.gate());
        registry.register(late.clone());
        assert_eq!(late.state(), SubscriptionState::Cancelled);
    }

    #[test]
    fn test_states_snapshot() {
        let (registry, subs) = registry_with(2);
        subs[0].cancel();

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert!(states
            .iter()
            .any(|(id, _, state)| *id == subs[0].id() && *state == SubscriptionState::Cancelled));
        assert!(states
            .iter()
            .any(|(id, _, state)| *id == subs[1].id() && *state == SubscriptionState::Active));
    }

    #[test]
    fn test_external_token_marks_registry_cancelled() {
        let parent = CancellationToken::new();
        let (registry, _rx) = SubscriptionRegistry::new(parent.child_token());
        parent.cancel();
        assert!(registry.is_cancelled());
    }
}
