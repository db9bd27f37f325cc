//! # Consequence
//!
//! Client-side coordination of a posted command with everything the server
//! may do about it: acknowledge it, refuse it, emit the events it causes,
//! emit a rejection, fail at the transport level, or stay silent.
//!
//! ## Core Concepts
//!
//! - [`Command`] = Intent posted through a [`ServerConnection`]
//! - Events = Facts the server emits later, addressed by an [`EventKey`]
//! - [`ConsequenceScope`] = What the caller waits for and how each outcome
//!   is handled, declared before anything is posted
//!
//! The key principle: **one command, one session, one resolution**.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ run(command, |scope| ...)
//!   ▼
//! CommandCoordinator ──► ConsequenceScope ──► on_event / on_rejection
//!   │                                            │
//!   │                                            ▼ subscribe()
//!   │                                      ServerConnection ◄── EventSink::deliver
//!   │ post()                                     │                    ▲
//!   ▼                                            ▼                    │
//! SubscriptionRegistry ◄── EventSubscription ── TimeoutRacer          │
//!   │                           │                                     │
//!   │                           └── first to fire / time out ─────────┘
//!   ▼
//! Outcome::{Positive, Negative, Errored}
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one resolution** per subscription and per session
//! 2. **Pre-post hooks finish before posting**
//! 3. **Acknowledge hooks run before any event handler**
//! 4. **Cancellation is idempotent** and never runs a handler twice
//! 5. **Unhandled failures are loud**: a server or network error with no
//!    registered hook is returned as [`ConsequenceError::UnhandledFailure`]
//!
//! ## Example
//!
//! ```ignore
//! use consequence::{CommandCoordinator, Command, EventKey, Outcome};
//!
//! #[derive(Debug, Clone)]
//! struct CreateTask { task_id: u64, title: String }
//! impl Command for CreateTask {}
//!
//! let coordinator = CommandCoordinator::new(connection);
//!
//! let outcome = coordinator
//!     .run(CreateTask { task_id: 42, title }, |scope| {
//!         scope.on_event(EventKey::new("TaskCreated", "task_id", "42"));
//!         scope
//!             .on_rejection(EventKey::new("TaskRejected", "task_id", "42"))
//!             .with_timeout(Duration::from_secs(5), |key| async move {
//!                 tracing::warn!(%key, "no answer from the server");
//!                 Ok(())
//!             });
//!         scope.on_post_server_error(|error| async move { report(error) });
//!         scope.on_network_error(|error| async move { report(error) });
//!     })
//!     .await?;
//!
//! if let Outcome::Positive { .. } = outcome {
//!     close_dialog();
//! }
//! ```
//!
//! ## What This Is Not
//!
//! Not a general pub/sub broker and not a persistent queue. Nothing is
//! guaranteed beyond the lifetime of one session.

// Core modules
mod bus;
mod config;
mod connection;
mod coordinator;
mod core;
mod error;
mod modal;
mod racer;
mod registry;
mod scope;
mod subscription;

// In-memory transport for tests and demos
pub mod memory;


// Re-export core types
pub use crate::core::{
    Command, Event, EventEnvelope, EventKey, EventKind, SessionId, SubscriptionId,
};

// Re-export error types
pub use crate::error::{
    ConsequenceError, FailureCategory, NetworkError, PostError, ServerError, SubscribeError,
};

// Re-export the transport seam
pub use connection::{Acknowledgement, ServerConnection, TransportSubscription};

// Re-export coordination
pub use coordinator::{CommandCoordinator, NegativeReason, Outcome, Session};
pub use racer::TimeoutRacer;
pub use registry::SubscriptionRegistry;
pub use scope::{ConsequenceScope, HookFuture};
pub use subscription::{EventSink, EventSubscription, SubscriptionState};

// Re-export supporting pieces
pub use bus::EventBus;
pub use config::{CoordinatorConfig, DEFAULT_EVENT_TIMEOUT, DEFAULT_TIMEOUT_ENV};
pub use modal::{ModalAffordances, ModalCoordinator};
