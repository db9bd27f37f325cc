//! Declarative registration surface for one coordination session.
//!
//! A [`ConsequenceScope`] is handed to the configure closure of
//! [`CommandCoordinator::run`](crate::CommandCoordinator::run). It only
//! collects hooks and subscriptions; nothing is posted until the closure
//! returns, so the set of subscriptions is fixed before the command leaves.
//!
//! | Method | Runs when |
//! |--------|-----------|
//! | [`on_before_post`](ConsequenceScope::on_before_post) | before the command is posted, in order |
//! | [`on_acknowledge`](ConsequenceScope::on_acknowledge) | after the server acknowledged, in order |
//! | [`on_post_server_error`](ConsequenceScope::on_post_server_error) | the server refused the command |
//! | [`on_network_error`](ConsequenceScope::on_network_error) | the transport failed while posting or waiting |
//! | [`on_event`](ConsequenceScope::on_event) / [`on_rejection`](ConsequenceScope::on_rejection) | the first matching event arrives |
//! | [`on_any_event`](ConsequenceScope::on_any_event) / [`on_any_rejection`](ConsequenceScope::on_any_rejection) | fallback for subscriptions without [`handled_as`](crate::EventSubscription::handled_as) |
//! | [`on_any_timeout`](ConsequenceScope::on_any_timeout) | fallback for subscriptions without their own timeout handler |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use smallvec::SmallVec;
use tracing::warn;

use crate::connection::Subscriber;
use crate::core::{EventEnvelope, EventKey, EventKind};
use crate::error::{NetworkError, ServerError};
use crate::registry::SubscriptionRegistry;
use crate::subscription::EventSubscription;

/// Future returned by every hook and handler.
pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;

pub(crate) type Hook = Box<dyn FnOnce() -> HookFuture + Send>;
pub(crate) type ErrorHook<E> = Box<dyn FnOnce(E) -> HookFuture + Send>;
pub(crate) type EventHandler = Box<dyn FnOnce(EventEnvelope) -> HookFuture + Send>;
pub(crate) type TimeoutHandler = Box<dyn FnOnce(EventKey) -> HookFuture + Send>;

pub(crate) fn boxed<F, Fut>(hook: F) -> Hook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || hook().boxed())
}

pub(crate) fn boxed_with_arg<A, F, Fut>(hook: F) -> Box<dyn FnOnce(A) -> HookFuture + Send>
where
    A: 'static,
    F: FnOnce(A) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |arg| hook(arg).boxed())
}

/// Everything a scope collected, consumed by the coordinator.
pub(crate) struct ScopeHooks {
    pub before_post: SmallVec<[Hook; 2]>,
    pub acknowledge: SmallVec<[Hook; 2]>,
    pub server_error: SmallVec<[ErrorHook<ServerError>; 1]>,
    pub network_error: SmallVec<[ErrorHook<NetworkError>; 1]>,
    pub default_event: Option<EventHandler>,
    pub default_rejection: Option<EventHandler>,
    pub default_timeout_handler: Option<TimeoutHandler>,
    pub default_timeout: Option<Duration>,
}

/// Builder-populated set of hooks and subscriptions for one command.
///
/// # Example
///
/// ```ignore
/// let outcome = coordinator
///     .run(CreateTask { task_id, title }, |scope| {
///         scope.on_before_post(move || async move {
///             submitting.send_replace(true);
///             Ok(())
///         });
///         scope.on_event(EventKey::new("TaskCreated", "task_id", task_id.to_string()));
///         scope
///             .on_rejection(EventKey::new("TaskRejected", "task_id", task_id.to_string()))
///             .handled_as(|envelope| async move {
///                 show_rejection(envelope.downcast_ref::<TaskRejected>());
///                 Ok(())
///             });
///         scope.on_network_error(|error| async move {
///             warn!(%error, "could not reach the server");
///             Ok(())
///         });
///     })
///     .await?;
/// ```
pub struct ConsequenceScope {
    subscriber: Arc<dyn Subscriber>,
    registry: SubscriptionRegistry,
    hooks: ScopeHooks,
}

impl ConsequenceScope {
    pub(crate) fn new(subscriber: Arc<dyn Subscriber>, registry: SubscriptionRegistry) -> Self {
        Self {
            subscriber,
            registry,
            hooks: ScopeHooks {
                before_post: SmallVec::new(),
                acknowledge: SmallVec::new(),
                server_error: SmallVec::new(),
                network_error: SmallVec::new(),
                default_event: None,
                default_rejection: None,
                default_timeout_handler: None,
                default_timeout: None,
            },
        }
    }

    /// Registry tracking the subscriptions created through this scope.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Run `hook` before the command is posted.
    ///
    /// Pre-post hooks run sequentially in registration order and all complete
    /// before the command is transmitted.
    pub fn on_before_post<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.before_post.push(boxed(hook));
        self
    }

    /// Run `hook` after the server acknowledged the command.
    pub fn on_acknowledge<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.acknowledge.push(boxed(hook));
        self
    }

    /// Run `hook` if the server refuses the command while posting.
    pub fn on_post_server_error<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce(ServerError) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.server_error.push(boxed_with_arg(hook));
        self
    }

    /// Run `hook` if the transport fails while posting or awaiting events.
    pub fn on_network_error<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce(NetworkError) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.network_error.push(boxed_with_arg(hook));
        self
    }

    /// Handler for matching events whose subscription has no override.
    pub fn on_any_event<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce(EventEnvelope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.default_event = Some(boxed_with_arg(handler));
        self
    }

    /// Handler for rejections whose subscription has no override.
    pub fn on_any_rejection<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce(EventEnvelope) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.default_rejection = Some(boxed_with_arg(handler));
        self
    }

    /// Handler for timeouts of subscriptions without their own handler.
    pub fn on_any_timeout<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce(EventKey) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.default_timeout_handler = Some(boxed_with_arg(handler));
        self
    }

    /// Countdown used by subscriptions that do not set their own.
    pub fn default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.hooks.default_timeout = Some(timeout);
        self
    }

    /// Wait for an event matching `key`; its arrival resolves positively.
    pub fn on_event(&mut self, key: EventKey) -> EventSubscription {
        self.subscribe(key, EventKind::Event)
    }

    /// Wait for a rejection matching `key`; its arrival resolves negatively.
    pub fn on_rejection(&mut self, key: EventKey) -> EventSubscription {
        self.subscribe(key, EventKind::Rejection)
    }

    /// Subscribe through the connection right away so that failures surface
    /// before anything is posted.
    fn subscribe(&mut self, key: EventKey, kind: EventKind) -> EventSubscription {
        let subscription = EventSubscription::new(key.clone(), kind, self.registry.gate());
        self.registry.register(subscription.clone());

        match self.subscriber.subscribe_sink(&key, subscription.sink()) {
            Ok(transport) => subscription.attach_transport(transport),
            Err(error) => {
                warn!(
                    session = %self.registry.session_id(),
                    key = %key,
                    %kind,
                    error = %error,
                    "failed to subscribe"
                );
                subscription.mark_failed(error);
            }
        }

        subscription
    }

    pub(crate) fn into_parts(self) -> (SubscriptionRegistry, ScopeHooks) {
        (self.registry, self.hooks)
    }
}

impl std::fmt::Debug for ConsequenceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsequenceScope")
            .field("registry", &self.registry)
            .field("before_post", &self.hooks.before_post.len())
            .field("acknowledge", &self.hooks.acknowledge.len())
            .field("server_error", &self.hooks.server_error.len())
            .field("network_error", &self.hooks.network_error.len())
            .field("default_timeout", &self.hooks.default_timeout)
            .finish_non_exhaustive()
    }
}
