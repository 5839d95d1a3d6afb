//! Connection observer callbacks and launch classification.

use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::handle::RemoteHandle;

/// Why a connection finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked for the release and the target acknowledged it.
    Graceful,
    /// The remote process backing the target died.
    TargetDied,
    /// The caller process died and the broker reclaimed its connections.
    CallerDied,
    /// A lifecycle step did not complete within its window.
    TimedOut,
}

impl DisconnectReason {
    /// Stable code delivered to observers; non-zero means non-graceful.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::TargetDied => -1,
            Self::CallerDied => -2,
            Self::TimedOut => -3,
        }
    }
}

/// How a target serves its callers, reported by the target at connect time.
///
/// Classification is unknown until the first connect completes, which is
/// why client-side records start out unindexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchClass {
    /// One shared instance serves every caller and session.
    Singleton,
    /// One instance per calling session.
    PerSession,
}

impl LaunchClass {
    /// Stable wire code carried on the connect-done notification.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Singleton => 0,
            Self::PerSession => 1,
        }
    }

    /// Parses a classification code; unknown codes classify as per-session,
    /// the conservative choice (never collapses distinct instances).
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Singleton,
            _ => Self::PerSession,
        }
    }
}

/// Callback surface a connect request registers with the broker.
///
/// Implementations must be cheap and non-blocking: the broker invokes them
/// outside its state lock but on its own threads. Observer identity (for
/// disconnect lookup and death reclamation) is the allocation behind the
/// `Arc`, exposed through [`observer_key`].
pub trait ConnectionObserver: Send + Sync {
    /// The target attached and produced a callable handle. `class_code` is
    /// a [`LaunchClass`] code.
    fn on_connect_done(&self, descriptor: &Descriptor, handle: RemoteHandle, class_code: i32);

    /// The connection finished; `code` is a [`DisconnectReason`] code.
    fn on_disconnect_done(&self, descriptor: &Descriptor, code: i32);
}

/// Stable lookup key for an observer: the address of its allocation.
///
/// Two clones of the same `Arc` map to the same key; two separately
/// constructed observers never collide.
#[must_use]
pub fn observer_key(observer: &Arc<dyn ConnectionObserver>) -> usize {
    Arc::as_ptr(observer).cast::<()>() as usize
}
