//! Deadline timers keyed by request id
//!
//! Each scheduled deadline is a spawned tokio task that sleeps and then runs
//! its expiry future. Handles are kept so a deadline can be aborted when the
//! request completes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Owns one timer task per key
#[derive(Debug, Default)]
pub struct DeadlineScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        // A panicked holder cannot leave the map half-updated
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `on_expiry` after `delay`. Replaces (and aborts) any timer already
    /// held under `key`.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, on_expiry: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_expiry.await;
        });
        debug!(key = %key, delay_secs = delay.as_secs(), "deadline scheduled");
        if let Some(previous) = self.tasks().insert(key, handle) {
            previous.abort();
        }
    }

    /// Abort the timer for `key`. Returns whether one was held.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks().remove(key) {
            Some(handle) => {
                handle.abort();
                debug!(key = %key, "deadline cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop the handle without aborting; called by the expiry future itself.
    pub fn forget(&self, key: &str) -> bool {
        self.tasks().remove(key).is_some()
    }

    /// True while a live timer is held for `key`
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.tasks()
            .get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.tasks().values().filter(|h| !h.is_finished()).count()
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.tasks().drain() {
            handle.abort();
        }
    }
}

impl Drop for DeadlineScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
