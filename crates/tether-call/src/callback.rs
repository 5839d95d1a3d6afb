//! Caller callbacks.
//!
//! One registered interest in a target's resolution. The completion
//! closure fires at most once, guarded by an atomic flag, no matter how
//! connect-done and death events interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tether_core::error::CallError;
use tether_core::handle::RemoteHandle;
use tracing::debug;

use crate::record::LocalCallRecord;

type Completion = Box<dyn FnOnce(Result<RemoteHandle, CallError>) + Send>;

/// One outstanding interest in a target.
pub struct CallerCallback {
    id: u64,
    fired: AtomicBool,
    completion: Mutex<Option<Completion>>,
    /// Optional remote-state hook, invoked after resolution when the
    /// target reports foreground/background moves.
    state_changed: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    record: Mutex<Weak<LocalCallRecord>>,
}

impl CallerCallback {
    /// Wraps a completion closure.
    pub fn new(completion: impl FnOnce(Result<RemoteHandle, CallError>) + Send + 'static) -> Arc<Self> {
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            fired: AtomicBool::new(false),
            completion: Mutex::new(Some(Box::new(completion))),
            state_changed: Mutex::new(None),
            record: Mutex::new(Weak::new()),
        })
    }

    /// Stable id, for diagnostics.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Installs the remote-state hook.
    pub fn on_state_changed(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.state_changed.lock().expect("callback poisoned") = Some(Box::new(hook));
    }

    /// Whether the completion already ran.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fires the completion. Returns `false` when it already fired; the
    /// closure never runs twice.
    pub fn fire(&self, result: Result<RemoteHandle, CallError>) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(id = self.id, "completion already fired, dropping result");
            return false;
        }
        let completion = self
            .completion
            .lock()
            .expect("callback poisoned")
            .take();
        if let Some(completion) = completion {
            completion(result);
        }
        true
    }

    /// Delivers a remote-state notification to the hook, if installed.
    pub fn notify_state(&self, state: &str) {
        if let Some(hook) = self
            .state_changed
            .lock()
            .expect("callback poisoned")
            .as_ref()
        {
            hook(state);
        }
    }

    /// Binds the owning record. Set when the record adopts the caller.
    pub fn bind_record(&self, record: &Arc<LocalCallRecord>) {
        *self.record.lock().expect("callback poisoned") = Arc::downgrade(record);
    }

    /// The owning record, if it still exists.
    #[must_use]
    pub fn record(&self) -> Weak<LocalCallRecord> {
        self.record.lock().expect("callback poisoned").clone()
    }
}

impl std::fmt::Debug for CallerCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerCallback")
            .field("id", &self.id)
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let callback = CallerCallback::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(callback.fire(Ok(RemoteHandle::new("svc"))));
        assert!(!callback.fire(Err(CallError::TargetDied)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(callback.has_fired());
    }

    #[test]
    fn test_concurrent_fire_runs_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let callback = CallerCallback::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let callback = Arc::clone(&callback);
            handles.push(std::thread::spawn(move || {
                callback.fire(Err(CallError::TargetDied));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_result_is_delivered() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let callback = CallerCallback::new(move |result| {
            *seen2.lock().unwrap() = Some(result.map(|h| h.identity()));
        });
        callback.fire(Err(CallError::TargetDied));
        assert_eq!(*seen.lock().unwrap(), Some(Err(CallError::TargetDied)));
    }
}
