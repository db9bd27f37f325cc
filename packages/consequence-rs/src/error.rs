//! Structured error types for command-consequence coordination.
//!
//! Transport failures are always routed into this taxonomy, never propagated
//! raw:
//!
//! | Failure | Type | Session result |
//! |---------|------|----------------|
//! | Subscription could not be registered | [`SubscribeError`] | `Negative`, nothing posted |
//! | Server refused the command before acknowledging | [`ServerError`] | `Errored`, server-error hooks |
//! | Transport failure while posting or waiting | [`NetworkError`] | `Errored`, network-error hooks |
//! | No hook registered for the failure that occurred | [`ConsequenceError::UnhandledFailure`] | `Err` |
//! | A hook returned an error | [`ConsequenceError::Hook`] | `Err` |
//!
//! Timeouts are not errors: they resolve the session negatively.

use std::fmt;

use thiserror::Error;

use crate::core::EventKey;

/// The server could not process the command before acknowledging it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error: {message}")]
pub struct ServerError {
    /// Optional machine-readable code supplied by the server.
    pub code: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl ServerError {
    /// Create a server error with a message and no code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Attach a machine-readable code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Transport-level failure. Whether the command was acknowledged is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network error: {message}")]
pub struct NetworkError {
    /// Human-readable description.
    pub message: String,
}

impl NetworkError {
    /// Create a network error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure to register interest in an event at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// The transport refused the subscription.
    #[error("subscription to {key} refused: {reason}")]
    Refused {
        /// Key that could not be subscribed.
        key: EventKey,
        /// Why the transport refused it.
        reason: String,
    },

    /// The transport is not connected.
    #[error("cannot subscribe to {key}: {source}")]
    Disconnected {
        /// Key that could not be subscribed.
        key: EventKey,
        /// Underlying transport failure.
        source: NetworkError,
    },
}

/// Failure returned by [`ServerConnection::post`](crate::ServerConnection::post).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    /// Server-side refusal before acknowledgement.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// Transport failure.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Failure categories that require a caller-registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// Server error while posting.
    ServerError,
    /// Network error while posting or awaiting outcomes.
    NetworkError,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCategory::ServerError => write!(f, "server error"),
            FailureCategory::NetworkError => write!(f, "network error"),
        }
    }
}

/// Errors returned by a coordination run.
///
/// These are never normal outcomes: either caller code failed, or the caller
/// broke the contract of handling every failure category that can occur.
#[derive(Debug, Error)]
pub enum ConsequenceError {
    /// A failure occurred for which the caller registered zero hooks.
    #[error("{category} occurred but no handler was registered for it: {message}")]
    UnhandledFailure {
        /// Which failure category was left unhandled.
        category: FailureCategory,
        /// Description of the failure itself.
        message: String,
    },

    /// A caller-supplied hook or handler returned an error.
    #[error("consequence hook failed: {0:#}")]
    Hook(anyhow::Error),

    /// The spawned session task panicked or was aborted.
    #[error("session task ended abnormally: {message}")]
    SessionAborted {
        /// Description from the task join error.
        message: String,
    },
}

impl ConsequenceError {
    /// Returns true if this is the missing-handler contract violation.
    pub fn is_unhandled_failure(&self) -> bool {
        matches!(self, ConsequenceError::UnhandledFailure { .. })
    }
}
