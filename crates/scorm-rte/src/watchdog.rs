//! Initialization watchdog.
//!
//! Content that never calls `Initialize` leaves the learner looking at a
//! course that records nothing. The watchdog is a cancellable timer task
//! that reports this; it never tears the session down.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// A one-shot, cancellable timer.
#[derive(Debug, Default)]
pub struct InitWatchdog {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InitWatchdog {
    /// Creates a disarmed watchdog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the timer, replacing any running one. `on_fire` runs once
    /// after `timeout` unless the watchdog is cancelled first.
    pub fn arm<F>(&self, timeout: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire();
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(timeout_ms = timeout.as_millis(), "Initialization watchdog armed");
    }

    /// Stops the timer. Returns `true` if a pending timer was cancelled.
    pub fn cancel(&self) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) if !task.is_finished() => {
                task.abort();
                debug!("Initialization watchdog cancelled");
                true
            }
            _ => false,
        }
    }

    /// Returns `true` while a timer is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for InitWatchdog {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
