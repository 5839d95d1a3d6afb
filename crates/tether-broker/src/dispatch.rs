//! Lifecycle dispatcher seam.
//!
//! The manager never talks to a target process directly. Every lifecycle
//! transaction is handed to a [`LifecycleDispatcher`], which forwards it
//! over whatever transport backs the deployment. Transactions are one-way:
//! the target answers later through the manager's `*_done` and
//! `transition_done` entry points. The one exception is
//! [`LifecycleDispatcher::prepare_terminate`], which the external protocol
//! requires to be answered synchronously.

use tether_core::descriptor::Descriptor;
use tether_core::handle::{SchedulerHandle, TargetToken};
use tether_core::lifecycle::LifecycleState;

/// Immutable view of a target record handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct TargetSnapshot {
    /// Token of the target instance.
    pub token: TargetToken,
    /// Descriptor the instance was resolved from.
    pub descriptor: Descriptor,
    /// Lifecycle state at dispatch time.
    pub state: LifecycleState,
    /// Scheduling handle bound at attach, if the target has attached.
    pub scheduler: Option<SchedulerHandle>,
}

/// The lifecycle transaction being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOp {
    /// Bring the target process up.
    Load,
    /// Ask a freshly attached target to settle into the inactive state.
    Inactivate,
    /// Deliver the pending connect to the target.
    Connect,
    /// Deliver a disconnect to the target.
    Disconnect,
    /// Deliver a start command to the target.
    Command,
    /// Move the target to the foreground.
    Foreground,
    /// Move the target to the background.
    Background,
    /// Tear the target down.
    Terminate,
}

impl DispatchOp {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Inactivate => "inactivate",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Command => "command",
            Self::Foreground => "foreground",
            Self::Background => "background",
            Self::Terminate => "terminate",
        }
    }
}

/// External collaborator that carries lifecycle transactions to targets.
///
/// Implementations must not block and must not call back into the manager
/// from inside these methods; completions come later, from the transport's
/// own threads, through the manager entry points.
pub trait LifecycleDispatcher: Send + Sync {
    /// Carries `op` to the target described by `target`.
    fn dispatch(&self, op: DispatchOp, target: &TargetSnapshot);

    /// Synchronously asks the target whether termination may proceed.
    ///
    /// Called from the manager's work queue with a deadline on the caller
    /// side; a slow implementation costs the caller its default answer,
    /// nothing more.
    fn prepare_terminate(&self, target: &TargetSnapshot) -> bool {
        let _ = target;
        true
    }
}
