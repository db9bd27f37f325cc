//! Posting a command and resolving its consequences.
//!
//! # Session lifecycle
//!
//! ```text
//! Configuring ──► Posting ──► AwaitingOutcome ──► Resolved
//!      │             │               │              ├─ Positive  (event)
//!      │             │               │              ├─ Negative  (rejection, timeout,
//!      │             │               │              │             subscribe failure, cancel)
//!      └─────────────┴───────────────┴─────────────►└─ Errored   (server / network error)
//! ```
//!
//! A session resolves exactly once. Whichever of the first matching event,
//! the first elapsed countdown, a transport failure, or cancellation gets
//! there first decides the outcome; every other subscription is cancelled
//! before any outcome handler runs.
//!
//! # Ordering
//!
//! 1. Pre-post hooks complete before the command is transmitted.
//! 2. Acknowledge hooks run before any event handler of the session.
//! 3. Once a resolution path starts, no other resolution path starts.
//! 4. Hooks of one category run sequentially in registration order.

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::connection::{ServerConnection, Subscriber};
use crate::core::{Command, EventKey, SessionId, SubscriptionId};
use crate::error::{
    ConsequenceError, FailureCategory, NetworkError, PostError, ServerError, SubscribeError,
};
use crate::registry::SubscriptionRegistry;
use crate::scope::{ConsequenceScope, ErrorHook, EventHandler, ScopeHooks, TimeoutHandler};
use crate::subscription::{EventSubscription, Resolution};

/// Why a session ended negatively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegativeReason {
    /// A rejection event arrived first.
    Rejected {
        /// Key of the rejection that decided the session.
        key: EventKey,
    },
    /// A subscription's countdown elapsed first.
    TimedOut {
        /// Key of the subscription that timed out.
        key: EventKey,
    },
    /// A subscription could not be registered with the transport. The
    /// command was never posted.
    SubscribeFailed(SubscribeError),
    /// The session was cancelled, every subscription was cancelled
    /// individually, or a subscription was cancelled before posting, before
    /// anything else decided it.
    Cancelled,
}

/// How a session resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A subscribed event arrived first, or the command was acknowledged and
    /// the session had no subscriptions (`key` is `None`).
    Positive {
        /// Key of the event that decided the session.
        key: Option<EventKey>,
    },
    /// See [`NegativeReason`].
    Negative(NegativeReason),
    /// Posting failed, or the transport failed while awaiting events, and
    /// the registered hooks for that category ran.
    Errored(PostError),
}

impl Outcome {
    /// Returns true for [`Outcome::Positive`].
    pub fn is_positive(&self) -> bool {
        matches!(self, Outcome::Positive { .. })
    }

    /// Returns true for [`Outcome::Negative`].
    pub fn is_negative(&self) -> bool {
        matches!(self, Outcome::Negative(_))
    }

    /// Returns true for [`Outcome::Errored`].
    pub fn is_errored(&self) -> bool {
        matches!(self, Outcome::Errored(_))
    }
}

/// Posts commands through a [`ServerConnection`] and coordinates their
/// consequences.
///
/// Cheap to clone; every clone shares the same connection. Each call to
/// [`run`](Self::run), [`post`](Self::post) or [`start`](Self::start) is an
/// independent session with its own registry.
///
/// # Example
///
/// ```ignore
/// let coordinator = CommandCoordinator::new(connection)
///     .with_config(CoordinatorConfig::from_env()?);
///
/// let created = coordinator
///     .post(CreateTask { task_id, title }, |scope| {
///         scope.on_event(EventKey::for_value("TaskCreated", "task_id", &task_id)?);
///         scope.on_rejection(EventKey::for_value("TaskRejected", "task_id", &task_id)?);
///         scope.on_post_server_error(|error| async move { show(error) });
///         scope.on_network_error(|error| async move { show(error) });
///     })
///     .await?;
/// ```
pub struct CommandCoordinator<C: ServerConnection> {
    connection: Arc<C>,
    config: CoordinatorConfig,
}

impl<C: ServerConnection> Clone for CommandCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            config: self.config,
        }
    }
}

impl<C: ServerConnection> CommandCoordinator<C> {
    /// Create a coordinator with the default configuration.
    pub fn new(connection: Arc<C>) -> Self {
        Self {
            connection,
            config: CoordinatorConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// The connection commands are posted through.
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Post `command` and wait for the session to resolve.
    ///
    /// `configure` runs synchronously before anything is posted and declares
    /// every hook and subscription of the session.
    ///
    /// # Errors
    ///
    /// - [`ConsequenceError::UnhandledFailure`] if a server or network error
    ///   occurred and no hook was registered for it
    /// - [`ConsequenceError::Hook`] if a hook or handler returned an error
    pub async fn run<F>(
        &self,
        command: C::Command,
        configure: F,
    ) -> Result<Outcome, ConsequenceError>
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        self.run_with_cancellation(command, CancellationToken::new(), configure)
            .await
    }

    /// Like [`run`](Self::run), resolving as [`NegativeReason::Cancelled`]
    /// when `cancellation` fires first.
    ///
    /// Cancelling the token cancels every subscription and abandons any hook
    /// or handler still running.
    pub async fn run_with_cancellation<F>(
        &self,
        command: C::Command,
        cancellation: CancellationToken,
        configure: F,
    ) -> Result<Outcome, ConsequenceError>
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        self.prepare(command, cancellation.child_token(), configure)
            .execute()
            .await
    }

    /// Post `command` and report whether a positive outcome was reached.
    pub async fn post<F>(&self, command: C::Command, configure: F) -> Result<bool, ConsequenceError>
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        Ok(self.run(command, configure).await?.is_positive())
    }

    /// Configure the session now and drive it on a spawned task.
    ///
    /// The returned [`Session`] holds the registry for early cancellation.
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(&self, command: C::Command, configure: F) -> Session
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        let prepared = self.prepare(command, CancellationToken::new(), configure);
        let registry = prepared.registry.clone();
        let task = tokio::spawn(prepared.execute());
        Session { registry, task }
    }

    fn prepare<F>(
        &self,
        command: C::Command,
        cancellation: CancellationToken,
        configure: F,
    ) -> PreparedSession<C>
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        let (registry, resolutions) = SubscriptionRegistry::new(cancellation);
        let subscriber: Arc<dyn Subscriber> = self.connection.clone();

        let mut scope = ConsequenceScope::new(subscriber, registry);
        configure(&mut scope);
        let (registry, hooks) = scope.into_parts();

        let default_timeout = hooks.default_timeout.unwrap_or(self.config.default_timeout);
        debug!(
            session = %registry.session_id(),
            command = command.command_type(),
            subscriptions = registry.len(),
            ?default_timeout,
            "session configured"
        );

        PreparedSession {
            connection: self.connection.clone(),
            command,
            registry,
            hooks,
            resolutions,
            default_timeout,
        }
    }
}

impl<C: ServerConnection> std::fmt::Debug for CommandCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A session driven on a spawned task.
///
/// Dropping the handle does not stop the session; use
/// [`cancel`](Self::cancel) for that.
#[derive(Debug)]
pub struct Session {
    registry: SubscriptionRegistry,
    task: JoinHandle<Result<Outcome, ConsequenceError>>,
}

impl Session {
    /// ID of the session.
    pub fn id(&self) -> SessionId {
        self.registry.session_id()
    }

    /// Registry of the session's subscriptions.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Cancel the session. Idempotent.
    ///
    /// Returns how many live subscriptions were cancelled by this call.
    pub fn cancel(&self) -> usize {
        self.registry.cancel_all()
    }

    /// Returns true once the session resolved (or failed).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to resolve.
    pub async fn outcome(self) -> Result<Outcome, ConsequenceError> {
        self.task
            .await
            .map_err(|join_error| ConsequenceError::SessionAborted {
                message: join_error.to_string(),
            })?
    }

    /// Wait for the session and report whether it resolved positively.
    pub async fn positive(self) -> Result<bool, ConsequenceError> {
        Ok(self.outcome().await?.is_positive())
    }
}

/// Cancels whatever is still live when the session ends on any path,
/// including the session future being dropped.
struct ReleaseOnDrop(SubscriptionRegistry);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct PreparedSession<C: ServerConnection> {
    connection: Arc<C>,
    command: C::Command,
    registry: SubscriptionRegistry,
    hooks: ScopeHooks,
    resolutions: mpsc::UnboundedReceiver<Resolution>,
    default_timeout: Duration,
}

impl<C: ServerConnection> PreparedSession<C> {
    async fn execute(self) -> Result<Outcome, ConsequenceError> {
        let registry = self.registry.clone();
        let _release = ReleaseOnDrop(registry.clone());
        let session = registry.session_id();
        let cancellation = registry.cancellation().clone();

        let result = tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                let cancelled = registry.cancel_all();
                info!(%session, cancelled, "session cancelled");
                Ok(Outcome::Negative(NegativeReason::Cancelled))
            }

            result = self.drive() => result,
        };

        match &result {
            Ok(outcome) => info!(%session, ?outcome, "session resolved"),
            Err(e) => warn!(%session, error = %e, "session failed"),
        }
        result
    }

    async fn drive(self) -> Result<Outcome, ConsequenceError> {
        let PreparedSession {
            connection,
            command,
            registry,
            hooks,
            mut resolutions,
            default_timeout,
        } = self;
        let ScopeHooks {
            before_post,
            acknowledge,
            server_error,
            network_error,
            default_event,
            default_rejection,
            default_timeout_handler,
            ..
        } = hooks;

        let session = registry.session_id();
        let command_type = command.command_type();

        // A subscription that fired or failed while configuring has already
        // claimed the gate; only refused or cancelled ones end up here.
        if !registry.all_active() && registry.gate().try_settle() {
            registry.release();
            let reason = match registry.first_subscribe_error() {
                Some(error) => {
                    warn!(
                        %session,
                        command = command_type,
                        error = %error,
                        "subscription refused, command not posted"
                    );
                    NegativeReason::SubscribeFailed(error)
                }
                None => {
                    info!(
                        %session,
                        command = command_type,
                        "subscription cancelled before posting, command not posted"
                    );
                    NegativeReason::Cancelled
                }
            };
            return Ok(Outcome::Negative(reason));
        }

        if !registry.gate().is_settled() {
            for hook in before_post {
                hook().await.map_err(ConsequenceError::Hook)?;
            }
        }

        let handlers = OutcomeHandlers {
            event: default_event,
            rejection: default_rejection,
            timeout: default_timeout_handler,
            network_error,
        };

        if registry.gate().is_settled() {
            debug!(
                %session,
                command = command_type,
                "session decided before posting, command not posted"
            );
            return handlers.resolve(session, &registry, &mut resolutions).await;
        }

        debug!(%session, command = command_type, "posting command");
        match connection.post(command).await {
            Ok(ack) => {
                debug!(%session, acknowledged_at = %ack.acknowledged_at, "command acknowledged");
                for hook in acknowledge {
                    hook().await.map_err(ConsequenceError::Hook)?;
                }

                if registry.is_empty() {
                    return Ok(Outcome::Positive { key: None });
                }
                if !registry.gate().is_settled() {
                    registry.arm_timeouts(default_timeout);
                }
            }
            Err(error) => {
                if registry.gate().try_settle() {
                    registry.release();
                    return resolve_post_error(session, error, server_error, handlers.network_error)
                        .await;
                }

                // An event raced ahead of the post result and already decided.
                let (category, registered) = match &error {
                    PostError::Server(_) => (FailureCategory::ServerError, server_error.len()),
                    PostError::Network(_) => {
                        (FailureCategory::NetworkError, handlers.network_error.len())
                    }
                };
                if registered == 0 {
                    registry.release();
                    error!(
                        %session,
                        %category,
                        error = %error,
                        "no handler registered for failure"
                    );
                    return Err(ConsequenceError::UnhandledFailure {
                        category,
                        message: error.to_string(),
                    });
                }
                warn!(%session, error = %error, "post failed after the session was decided");
            }
        }

        handlers.resolve(session, &registry, &mut resolutions).await
    }
}

/// Handlers that may run once the session is awaiting its outcome.
struct OutcomeHandlers {
    event: Option<EventHandler>,
    rejection: Option<EventHandler>,
    timeout: Option<TimeoutHandler>,
    network_error: SmallVec<[ErrorHook<NetworkError>; 1]>,
}

impl OutcomeHandlers {
    /// Wait for the first deciding resolution and run its handler.
    async fn resolve(
        mut self,
        session: SessionId,
        registry: &SubscriptionRegistry,
        resolutions: &mut mpsc::UnboundedReceiver<Resolution>,
    ) -> Result<Outcome, ConsequenceError> {
        loop {
            let Some(resolution) = resolutions.recv().await else {
                return Ok(Outcome::Negative(NegativeReason::Cancelled));
            };

            match resolution {
                Resolution::Fired {
                    subscription,
                    envelope,
                } => {
                    registry.release();
                    let subscription = lookup(registry, subscription)?;
                    let key = envelope.key.clone();
                    let kind = subscription.kind();

                    let handler = subscription.take_handler().or_else(|| {
                        if kind.is_rejection() {
                            self.rejection.take()
                        } else {
                            self.event.take()
                        }
                    });
                    let handled = handler.is_some();
                    debug!(%session, %key, %kind, handled, "resolving on event");
                    if let Some(handler) = handler {
                        handler(envelope).await.map_err(ConsequenceError::Hook)?;
                    }

                    return Ok(if kind.is_rejection() {
                        Outcome::Negative(NegativeReason::Rejected { key })
                    } else {
                        Outcome::Positive { key: Some(key) }
                    });
                }

                Resolution::TimedOut { subscription } => {
                    registry.release();
                    let subscription = lookup(registry, subscription)?;
                    let key = subscription.key().clone();

                    debug!(%session, %key, "resolving on timeout");
                    let handler = subscription
                        .take_timeout_handler()
                        .or_else(|| self.timeout.take());
                    if let Some(handler) = handler {
                        handler(key.clone()).await.map_err(ConsequenceError::Hook)?;
                    }

                    return Ok(Outcome::Negative(NegativeReason::TimedOut { key }));
                }

                Resolution::NetworkError(error) => {
                    registry.release();
                    let hooks = self.network_error;
                    run_error_hooks(session, FailureCategory::NetworkError, &error, hooks).await?;
                    return Ok(Outcome::Errored(PostError::Network(error)));
                }

                Resolution::Cancelled { subscription } => {
                    debug!(%session, %subscription, "subscription cancelled");
                    if registry.all_cancelled() && registry.gate().try_settle() {
                        registry.release();
                        return Ok(Outcome::Negative(NegativeReason::Cancelled));
                    }
                }
            }
        }
    }
}

fn lookup(
    registry: &SubscriptionRegistry,
    id: SubscriptionId,
) -> Result<EventSubscription, ConsequenceError> {
    registry
        .get(id)
        .ok_or_else(|| ConsequenceError::SessionAborted {
            message: format!("resolution reported for unknown subscription {id}"),
        })
}

async fn resolve_post_error(
    session: SessionId,
    error: PostError,
    server_hooks: SmallVec<[ErrorHook<ServerError>; 1]>,
    network_hooks: SmallVec<[ErrorHook<NetworkError>; 1]>,
) -> Result<Outcome, ConsequenceError> {
    match &error {
        PostError::Server(server) => {
            run_error_hooks(session, FailureCategory::ServerError, server, server_hooks).await?
        }
        PostError::Network(network) => {
            run_error_hooks(session, FailureCategory::NetworkError, network, network_hooks).await?
        }
    }
    Ok(Outcome::Errored(error))
}

/// Run every hook of a failure category in order.
///
/// A failure nobody registered a hook for is a programming error in the
/// caller and is returned as [`ConsequenceError::UnhandledFailure`].
async fn run_error_hooks<E>(
    session: SessionId,
    category: FailureCategory,
    failure: &E,
    hooks: SmallVec<[ErrorHook<E>; 1]>,
) -> Result<(), ConsequenceError>
where
    E: Clone + std::fmt::Display,
{
    if hooks.is_empty() {
        error!(%session, %category, error = %failure, "no handler registered for failure");
        return Err(ConsequenceError::UnhandledFailure {
            category,
            message: failure.to_string(),
        });
    }

    warn!(%session, %category, error = %failure, hooks = hooks.len(), "handling failure");
    for hook in hooks {
        hook(failure.clone()).await.map_err(ConsequenceError::Hook)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Acknowledgement, TransportSubscription};
    use crate::core::EventEnvelope;
    use crate::memory::InMemoryConnection;
    use crate::subscription::{EventSink, SubscriptionState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct CreateTask {
        id: u32,
    }

    impl Command for CreateTask {}

    #[derive(Debug, Clone)]
    struct TaskCreated {
        id: u32,
    }

    fn created(id: u32) -> EventKey {
        EventKey::new("TaskCreated", "task_id", id.to_string())
    }

    fn rejected(id: u32) -> EventKey {
        EventKey::new("TaskRejected", "task_id", id.to_string())
    }

    fn coordinator() -> (
        CommandCoordinator<InMemoryConnection<CreateTask>>,
        Arc<InMemoryConnection<CreateTask>>,
    ) {
        let connection = Arc::new(InMemoryConnection::new());
        (CommandCoordinator::new(connection.clone()), connection)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    /// Transport that exposes its sinks, so a test can deliver while the
    /// session is still configuring or posting.
    #[derive(Default)]
    struct SinkConnection {
        sinks: Mutex<Vec<EventSink>>,
        posts: AtomicUsize,
        deliver_during_post: Mutex<Option<EventEnvelope>>,
        post_error: Mutex<Option<PostError>>,
    }

    struct Detached;

    impl TransportSubscription for Detached {
        fn unsubscribe(&self) {}
    }

    impl SinkConnection {
        fn deliver(&self, envelope: EventEnvelope) -> bool {
            let sinks = self.sinks.lock().unwrap().clone();
            sinks
                .iter()
                .filter(|sink| sink.deliver(envelope.clone()))
                .count()
                == 1
        }
    }

    #[async_trait::async_trait]
    impl ServerConnection for SinkConnection {
        type Command = CreateTask;

        fn subscribe(
            &self,
            _key: &EventKey,
            sink: EventSink,
        ) -> Result<Box<dyn TransportSubscription>, SubscribeError> {
            self.sinks.lock().unwrap().push(sink);
            Ok(Box::new(Detached))
        }

        async fn post(&self, _command: CreateTask) -> Result<Acknowledgement, PostError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            let early = self.deliver_during_post.lock().unwrap().take();
            if let Some(envelope) = early {
                self.deliver(envelope);
            }
            match self.post_error.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(Acknowledgement::now()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_subscriptions_resolve_positive_after_acknowledge() {
        let (coordinator, connection) = coordinator();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope
                    .on_before_post(move || async move {
                        o1.lock().unwrap().push("before-1");
                        Ok(())
                    })
                    .on_before_post(move || async move {
                        o2.lock().unwrap().push("before-2");
                        Ok(())
                    })
                    .on_acknowledge(move || async move {
                        o3.lock().unwrap().push("ack");
                        Ok(())
                    });
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Positive { key: None });
        assert_eq!(*order.lock().unwrap(), vec!["before-1", "before-2", "ack"]);
        assert_eq!(connection.posted(), vec![CreateTask { id: 1 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_wins_and_runs_override_only() {
        let (coordinator, connection) = coordinator();
        connection.react_with(crate::memory::Reaction::emit(
            Duration::from_secs(2),
            created(1),
            TaskCreated { id: 1 },
        ));

        let override_calls = counter();
        let default_calls = counter();
        let (oc, dc) = (override_calls.clone(), default_calls.clone());

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_any_event(move |_| async move {
                    dc.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_event(created(1)).handled_as(move |envelope| async move {
                    assert_eq!(envelope.downcast_ref::<TaskCreated>().map(|e| e.id), Some(1));
                    oc.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_rejection(rejected(1));
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Positive { key: Some(created(1)) });
        assert_eq!(override_calls.load(Ordering::SeqCst), 1);
        assert_eq!(default_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_resolves_negative_with_default_handler() {
        let (coordinator, connection) = coordinator();
        connection.react_with(crate::memory::Reaction::emit(
            Duration::from_millis(10),
            rejected(1),
            "no quota left".to_string(),
        ));

        let calls = counter();
        let c = calls.clone();
        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_any_rejection(move |envelope| async move {
                    assert!(envelope.is::<String>());
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_event(created(1));
                scope.on_rejection(rejected(1));
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Negative(NegativeReason::Rejected { key: rejected(1) })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_comes_from_config() {
        let connection = Arc::new(InMemoryConnection::<CreateTask>::new());
        let coordinator = CommandCoordinator::new(connection)
            .with_config(CoordinatorConfig::default().with_default_timeout(Duration::from_secs(3)));

        let started = tokio::time::Instant::now();
        let outcome = coordinator
            .run(CreateTask { id: 1 }, |scope| {
                scope.on_event(created(1));
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Negative(NegativeReason::TimedOut { key: created(1) }));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_default_timeout_overrides_config() {
        let (coordinator, _) = coordinator();
        let timeouts = counter();
        let t = timeouts.clone();

        let started = tokio::time::Instant::now();
        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.default_timeout(Duration::from_secs(2));
                scope.on_any_timeout(move |key| async move {
                    assert_eq!(key, created(1));
                    t.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_event(created(1));
            })
            .await
            .unwrap();

        assert!(outcome.is_negative());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_skips_post_and_hooks() {
        let (coordinator, connection) = coordinator();
        connection.refuse_subscriptions_for(created(1), "unknown event type");

        let hooks = counter();
        let h = hooks.clone();
        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_before_post(move || async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_rejection(rejected(1));
                scope.on_event(created(1));
            })
            .await
            .unwrap();

        match outcome {
            Outcome::Negative(NegativeReason::SubscribeFailed(SubscribeError::Refused {
                key, ..
            })) => assert_eq!(key, created(1)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
        assert!(connection.posted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_runs_hooks_and_cancels_subscriptions() {
        let (coordinator, connection) = coordinator();
        connection.fail_next_post(ServerError::new("duplicate task").into());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let subs = Arc::new(Mutex::new(Vec::new()));
        let captured = subs.clone();

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_post_server_error(move |error| async move {
                    s.lock().unwrap().push(error.message);
                    Ok(())
                });
                let sub = scope.on_event(created(1));
                captured.lock().unwrap().push(sub.clone());
            })
            .await
            .unwrap();

        assert!(outcome.is_errored());
        assert_eq!(*seen.lock().unwrap(), vec!["duplicate task".to_string()]);
        assert!(subs
            .lock()
            .unwrap()
            .iter()
            .all(|sub| sub.state() == SubscriptionState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhandled_server_error_is_fatal() {
        let (coordinator, connection) = coordinator();
        connection.fail_next_post(ServerError::new("boom").into());

        let err = coordinator
            .run(CreateTask { id: 1 }, |scope| {
                scope.on_network_error(|_| async { Ok(()) });
                scope.on_event(created(1));
            })
            .await
            .unwrap_err();

        assert!(err.is_unhandled_failure());
        assert!(matches!(
            err,
            ConsequenceError::UnhandledFailure {
                category: FailureCategory::ServerError,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhandled_network_error_while_waiting_is_fatal() {
        let (coordinator, connection) = coordinator();
        connection.react_with(crate::memory::Reaction::disconnect(
            Duration::from_secs(1),
            NetworkError::new("socket closed"),
        ));

        let err = coordinator
            .run(CreateTask { id: 1 }, |scope| {
                scope.on_post_server_error(|_| async { Ok(()) });
                scope.on_event(created(1));
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConsequenceError::UnhandledFailure {
                category: FailureCategory::NetworkError,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_hook_propagates() {
        let (coordinator, connection) = coordinator();

        let err = coordinator
            .run(CreateTask { id: 1 }, |scope| {
                scope.on_before_post(|| async { Err(anyhow::anyhow!("form invalid")) });
                scope.on_event(created(1));
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConsequenceError::Hook(_)));
        assert!(err.to_string().contains("form invalid"));
        assert!(connection.posted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_token_cancels_session() {
        let (coordinator, _) = coordinator();
        let token = CancellationToken::new();
        let handlers = counter();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let h = handlers.clone();
        let outcome = coordinator
            .run_with_cancellation(CreateTask { id: 1 }, token, move |scope| {
                scope.on_any_timeout(move |_| async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_event(created(1)).timeout_after(Duration::from_secs(5));
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Negative(NegativeReason::Cancelled));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handlers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_session_cancel_all_from_handle() {
        let (coordinator, _) = coordinator();
        let session = coordinator.start(CreateTask { id: 1 }, |scope| {
            scope.on_event(created(1));
            scope.on_rejection(rejected(1));
        });
        assert_eq!(session.registry().len(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let registry = session.registry().clone();
        assert_eq!(session.cancel(), 2);
        assert_eq!(session.cancel(), 0);

        assert_eq!(
            session.outcome().await.unwrap(),
            Outcome::Negative(NegativeReason::Cancelled)
        );
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_every_subscription_resolves_cancelled() {
        let (coordinator, _) = coordinator();
        let subs = Arc::new(Mutex::new(Vec::new()));
        let captured = subs.clone();

        let session = coordinator.start(CreateTask { id: 1 }, move |scope| {
            let mut captured = captured.lock().unwrap();
            captured.push(scope.on_event(created(1)));
            captured.push(scope.on_rejection(rejected(1)));
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        for sub in subs.lock().unwrap().iter() {
            assert!(sub.cancel());
        }

        assert_eq!(
            session.outcome().await.unwrap(),
            Outcome::Negative(NegativeReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_before_acknowledge_runs_handler_after_ack_hooks() {
        let (coordinator, connection) = coordinator();
        connection.set_post_latency(Duration::from_secs(1));

        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());

        let publisher = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            publisher.publish(created(1), TaskCreated { id: 1 });
        });

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_acknowledge(move || async move {
                    o1.lock().unwrap().push("ack");
                    Ok(())
                });
                scope.on_event(created(1)).handled_as(move |_: EventEnvelope| async move {
                    o2.lock().unwrap().push("event");
                    Ok(())
                });
            })
            .await
            .unwrap();

        assert!(outcome.is_positive());
        assert_eq!(*order.lock().unwrap(), vec!["ack", "event"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_returns_boolean() {
        let (coordinator, connection) = coordinator();
        connection.react_with(crate::memory::Reaction::emit(
            Duration::ZERO,
            created(7),
            TaskCreated { id: 7 },
        ));

        let positive = coordinator
            .post(CreateTask { id: 7 }, |scope| {
                scope.on_event(created(7));
            })
            .await
            .unwrap();
        assert!(positive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_delivered_while_configuring_decides_without_posting() {
        let connection = Arc::new(SinkConnection::default());
        let coordinator = CommandCoordinator::new(connection.clone());
        let handled = counter();
        let rejections = counter();
        let (h, r, transport) = (handled.clone(), rejections.clone(), connection.clone());

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_event(created(1)).handled_as(move |_| async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_rejection(rejected(1)).handled_as(move |_| async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                assert!(transport.deliver(EventEnvelope::new(created(1), TaskCreated { id: 1 })));
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Positive { key: Some(created(1)) });
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(rejections.load(Ordering::SeqCst), 0);
        assert_eq!(connection.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_delivered_by_pre_post_hook_skips_post() {
        let connection = Arc::new(SinkConnection::default());
        *connection.post_error.lock().unwrap() = Some(NetworkError::new("offline").into());
        let coordinator = CommandCoordinator::new(connection.clone());
        let handled = counter();
        let (h, transport) = (handled.clone(), connection.clone());

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_before_post(move || async move {
                    transport.deliver(EventEnvelope::new(created(1), TaskCreated { id: 1 }));
                    Ok(())
                });
                scope.on_event(created(1)).handled_as(move |_| async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Positive { key: Some(created(1)) });
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(connection.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_failure_after_early_event_without_hooks_is_fatal() {
        let connection = Arc::new(SinkConnection::default());
        *connection.deliver_during_post.lock().unwrap() =
            Some(EventEnvelope::new(created(1), TaskCreated { id: 1 }));
        *connection.post_error.lock().unwrap() = Some(NetworkError::new("reset").into());
        let coordinator = CommandCoordinator::new(connection.clone());
        let handled = counter();
        let h = handled.clone();

        let err = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_post_server_error(|_| async { Ok(()) });
                scope.on_event(created(1)).handled_as(move |_| async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConsequenceError::UnhandledFailure {
                category: FailureCategory::NetworkError,
                ..
            }
        ));
        assert_eq!(handled.load(Ordering::SeqCst), 0);
        assert_eq!(connection.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_failure_after_early_event_with_hooks_keeps_event() {
        let connection = Arc::new(SinkConnection::default());
        *connection.deliver_during_post.lock().unwrap() =
            Some(EventEnvelope::new(created(1), TaskCreated { id: 1 }));
        *connection.post_error.lock().unwrap() = Some(ServerError::new("late refusal").into());
        let coordinator = CommandCoordinator::new(connection);
        let handled = counter();
        let server_hooks = counter();
        let (h, sh) = (handled.clone(), server_hooks.clone());

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_post_server_error(move |_| async move {
                    sh.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                scope.on_event(created(1)).handled_as(move |_| async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Positive { key: Some(created(1)) });
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(server_hooks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_cancelled_while_configuring_resolves_cancelled() {
        let (coordinator, connection) = coordinator();
        let hooks = counter();
        let h = hooks.clone();

        let outcome = coordinator
            .run(CreateTask { id: 1 }, move |scope| {
                scope.on_before_post(move || async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                assert!(scope.on_event(created(1)).cancel());
                scope.on_rejection(rejected(1));
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Negative(NegativeReason::Cancelled));
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
        assert!(connection.posted().is_empty());
        assert_eq!(connection.live_subscriptions(), 0);
    }
}
