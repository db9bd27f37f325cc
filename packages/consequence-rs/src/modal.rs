//! Modal variant: a coordinator that drives a busy indicator and closes the
//! dialog that posted the command once the outcome is positive.
//!
//! Composition over inheritance: [`ModalCoordinator`] wraps a plain
//! [`CommandCoordinator`] and registers its own pre-post hook ahead of the
//! caller's.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::connection::ServerConnection;
use crate::coordinator::{CommandCoordinator, Outcome};
use crate::error::ConsequenceError;
use crate::scope::ConsequenceScope;

type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Busy flag plus close callback of a modal surface.
#[derive(Clone)]
pub struct ModalAffordances {
    busy: Arc<watch::Sender<bool>>,
    close: Option<CloseCallback>,
}

impl ModalAffordances {
    /// Affordances with no close callback.
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            busy: Arc::new(busy),
            close: None,
        }
    }

    /// Call `close` whenever a session resolves positively.
    pub fn with_close<F>(mut self, close: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(close));
        self
    }

    /// Watch the busy flag, e.g. to disable a submit button.
    pub fn busy(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    fn set_busy(&self, busy: bool) {
        self.busy.send_replace(busy);
    }

    fn close(&self) {
        if let Some(close) = &self.close {
            close();
        }
    }
}

impl Default for ModalAffordances {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModalAffordances {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModalAffordances")
            .field("busy", &self.is_busy())
            .field("closable", &self.close.is_some())
            .finish()
    }
}

/// Clears the busy flag however the session ends.
struct NotBusyOnDrop(ModalAffordances);

impl Drop for NotBusyOnDrop {
    fn drop(&mut self) {
        self.0.set_busy(false);
    }
}

/// [`CommandCoordinator`] bound to a modal surface.
///
/// # Example
///
/// ```ignore
/// let affordances = ModalAffordances::new().with_close(move || dialog.dismiss());
/// let modal = ModalCoordinator::new(coordinator.clone(), affordances.clone());
///
/// let mut busy = affordances.busy();
/// tokio::spawn(async move {
///     while busy.changed().await.is_ok() {
///         submit_button.set_enabled(!*busy.borrow());
///     }
/// });
///
/// modal.run(RenameTask { task_id, title }, |scope| {
///     scope.on_event(EventKey::new("TaskRenamed", "task_id", task_id.to_string()));
/// }).await?;
/// ```
pub struct ModalCoordinator<C: ServerConnection> {
    coordinator: CommandCoordinator<C>,
    affordances: ModalAffordances,
}

impl<C: ServerConnection> ModalCoordinator<C> {
    pub fn new(coordinator: CommandCoordinator<C>, affordances: ModalAffordances) -> Self {
        Self {
            coordinator,
            affordances,
        }
    }

    pub fn affordances(&self) -> &ModalAffordances {
        &self.affordances
    }

    /// Run a session with the busy flag raised from just before posting until
    /// resolution. A positive outcome closes the modal.
    pub async fn run<F>(
        &self,
        command: C::Command,
        configure: F,
    ) -> Result<Outcome, ConsequenceError>
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        let _not_busy = NotBusyOnDrop(self.affordances.clone());
        let affordances = self.affordances.clone();

        let outcome = self
            .coordinator
            .run(command, move |scope| {
                scope.on_before_post(move || async move {
                    affordances.set_busy(true);
                    Ok(())
                });
                configure(scope);
            })
            .await;

        self.affordances.set_busy(false);
        if matches!(&outcome, Ok(outcome) if outcome.is_positive()) {
            debug!("closing modal after positive outcome");
            self.affordances.close();
        }
        outcome
    }

    /// Like [`run`](Self::run), reporting whether the outcome was positive.
    pub async fn post<F>(&self, command: C::Command, configure: F) -> Result<bool, ConsequenceError>
    where
        F: FnOnce(&mut ConsequenceScope),
    {
        Ok(self.run(command, configure).await?.is_positive())
    }
}
