//! Per-transition timeout scheduling.
//!
//! Every asynchronous lifecycle step arms one timer here when it begins
//! and cancels it when the matching completion report arrives. A timer that
//! fires removes itself and runs its callback exactly once; re-arming the
//! same key replaces the previous timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Which lifecycle step a timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Load dispatched, waiting for attach.
    Load,
    /// Connect dispatched, waiting for connect-done.
    Connect,
    /// Command dispatched, waiting for command-done.
    Command,
    /// Inactivate dispatched, waiting for the inactive report.
    Inactive,
    /// Foreground move in flight.
    Foreground,
    /// Background move in flight.
    Background,
    /// Terminate dispatched, waiting for the terminate report.
    Terminate,
    /// Start requests queued behind an in-flight load.
    QueuedStart,
}

impl TimeoutKind {
    /// Short name used in logs and freeze diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Connect => "connect",
            Self::Command => "command",
            Self::Inactive => "inactive",
            Self::Foreground => "foreground",
            Self::Background => "background",
            Self::Terminate => "terminate",
            Self::QueuedStart => "queued_start",
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type TimerMap = HashMap<(TimeoutKind, u64), tokio::task::JoinHandle<()>>;

/// One named timer per (kind, record id).
#[derive(Default)]
pub struct TimeoutScheduler {
    timers: Arc<Mutex<TimerMap>>,
}

impl TimeoutScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer; an existing timer under the same key is replaced.
    ///
    /// `on_fire` runs on a spawned task after `delay`, unless the timer is
    /// cancelled or replaced first.
    pub fn arm(
        &self,
        kind: TimeoutKind,
        id: u64,
        delay: Duration,
        on_fire: impl FnOnce() + Send + 'static,
    ) {
        let timers = Arc::clone(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().expect("timer map poisoned").remove(&(kind, id));
            on_fire();
        });
        let replaced = self
            .timers
            .lock()
            .expect("timer map poisoned")
            .insert((kind, id), handle);
        if let Some(old) = replaced {
            trace!(%kind, id, "replacing armed timer");
            old.abort();
        }
    }

    /// Cancels a timer. Returns whether one was armed.
    pub fn cancel(&self, kind: TimeoutKind, id: u64) -> bool {
        match self
            .timers
            .lock()
            .expect("timer map poisoned")
            .remove(&(kind, id))
        {
            Some(handle) => {
                handle.abort();
                true
            },
            None => false,
        }
    }

    /// Number of timers currently armed.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.timers.lock().expect("timer map poisoned").len()
    }
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("armed", &self.armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = TimeoutScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        scheduler.arm(TimeoutKind::Load, 1, Duration::from_secs(5), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.armed(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let scheduler = TimeoutScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        scheduler.arm(TimeoutKind::Connect, 7, Duration::from_secs(3), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(TimeoutKind::Connect, 7));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.cancel(TimeoutKind::Connect, 7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces() {
        let scheduler = TimeoutScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = Arc::clone(&fired);
            scheduler.arm(TimeoutKind::Command, 3, Duration::from_secs(2), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(4)).await;
        // Only the replacement fires.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
