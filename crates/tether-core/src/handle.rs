//! Opaque handles and tokens.
//!
//! The broker never looks inside a remote object; it only needs a cheap,
//! cloneable handle whose identity survives cloning so that death events
//! and cache lookups can match. [`RemoteHandle`] is the callable proxy a
//! resolved caller receives; [`SchedulerHandle`] is the per-target handle a
//! freshly attached target thread hands to the manager. Both carry a
//! process-wide unique [`HandleIdentity`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a remote object, preserved across clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleIdentity(pub u64);

impl std::fmt::Display for HandleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

fn next_identity() -> HandleIdentity {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    HandleIdentity(NEXT.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug)]
struct HandleInner {
    identity: HandleIdentity,
    label: String,
}

/// Callable proxy to a connected target.
///
/// The actual invocation transport is out of scope here; the broker only
/// routes the handle to callers and compares identities when a death event
/// arrives.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    inner: Arc<HandleInner>,
}

impl RemoteHandle {
    /// Creates a handle with a fresh identity. `label` shows up in logs.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                identity: next_identity(),
                label: label.into(),
            }),
        }
    }

    /// Returns the identity shared by every clone of this handle.
    #[must_use]
    pub fn identity(&self) -> HandleIdentity {
        self.inner.identity
    }

    /// Returns whether `self` and `other` proxy the same remote object.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        self.inner.identity == other.inner.identity
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

/// Per-target scheduling handle bound at attach time.
///
/// Lifecycle transactions dispatched to the target travel through the seam
/// that produced this handle; the manager itself only stores it and checks
/// liveness by identity.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    /// Creates a scheduler handle with a fresh identity.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                identity: next_identity(),
                label: label.into(),
            }),
        }
    }

    /// Returns the identity shared by every clone of this handle.
    #[must_use]
    pub fn identity(&self) -> HandleIdentity {
        self.inner.identity
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

/// Token identifying one loaded-or-loading target instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetToken(pub u64);

impl TargetToken {
    /// Allocates a fresh token.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TargetToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// Token identifying the caller behind a connect or call request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerToken(pub u64);

impl CallerToken {
    /// Allocates a fresh token.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CallerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "caller#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_preserves_identity() {
        let a = RemoteHandle::new("svc");
        let b = a.clone();
        assert!(a.same_object(&b));
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_distinct_handles_differ() {
        let a = RemoteHandle::new("svc");
        let b = RemoteHandle::new("svc");
        assert!(!a.same_object(&b));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(TargetToken::next(), TargetToken::next());
        assert_ne!(CallerToken::next(), CallerToken::next());
    }
}
