//! Cancellable, re-armable countdown.
//!
//! A [`TimeoutRacer`] runs at most one countdown at a time. Arming it again
//! cancels the countdown in flight before starting the new one, so two
//! countdowns for the same owner never race each other.
//!
//! # Exactly-once expiry
//!
//! Every arm bumps a generation counter. An elapsed countdown only runs its
//! callback if it can compare-and-swap the generation it was started with,
//! so a countdown that wakes up just as it is being superseded (or cancelled)
//! stays silent even if it already got past its `sleep`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::subscription::lock;

/// A single-slot countdown that invokes its callback exactly once on expiry.
///
/// Must be armed from within a Tokio runtime.
#[derive(Default)]
pub struct TimeoutRacer {
    generation: Arc<AtomicU64>,
    current: Mutex<Option<CancellationToken>>,
}

impl TimeoutRacer {
    /// Create a racer with no countdown running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a countdown of `duration`, superseding any countdown in flight.
    ///
    /// `on_expire` runs once if the countdown elapses before the racer is
    /// re-armed or cancelled, and never otherwise.
    pub fn arm<F>(&self, duration: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();

        let armed_generation = {
            let mut current = lock(&self.current);
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        let generation = self.generation.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(generation = armed_generation, "countdown abandoned");
                }
                _ = tokio::time::sleep(duration) => {
                    let won = generation
                        .compare_exchange(
                            armed_generation,
                            armed_generation + 1,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    token.cancel();
                    if won {
                        on_expire();
                    } else {
                        trace!(generation = armed_generation, "countdown superseded at expiry");
                    }
                }
            }
        });
    }

    /// Cancel the countdown in flight, if any.
    ///
    /// Returns true if a countdown was still pending.
    pub fn cancel(&self) -> bool {
        let mut current = lock(&self.current);
        self.generation.fetch_add(1, Ordering::AcqRel);
        match current.take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Returns true if a countdown is currently pending.
    pub fn is_armed(&self) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl std::fmt::Debug for TimeoutRacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutRacer")
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl Drop for TimeoutRacer {
    fn drop(&mut self) {
        self.cancel();
    }
}
