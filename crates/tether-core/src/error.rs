//! Error taxonomy for both halves of the broker.
//!
//! All public entry points return these instead of panicking. Timeouts are
//! folded into the same channel as any other failure of an in-flight
//! request; they never abort the target record itself.

use thiserror::Error;

/// Errors surfaced by the server-side connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The descriptor is malformed or names nothing installable.
    #[error("invalid target descriptor: {uri}")]
    InvalidTarget {
        /// Canonical key of the offending descriptor.
        uri: String,
    },

    /// A connect request arrived without an observer.
    #[error("connect request carries no observer")]
    InvalidObserver,

    /// The referenced record or target does not exist.
    #[error("no such record: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The observer has no live connection records.
    #[error("observer has no live connections")]
    NotConnected,

    /// A lifecycle transition was reported for a record already in that
    /// state.
    #[error("target already in state {state}")]
    AlreadyInState {
        /// The state that was redundantly reported.
        state: String,
    },

    /// A lifecycle transition was reported out of order.
    #[error("unexpected transition report: expected {expected}, target is {actual}")]
    UnexpectedState {
        /// State the record needed to be in.
        expected: String,
        /// State the record is actually in.
        actual: String,
    },

    /// A lifecycle step did not complete within its window.
    #[error("lifecycle step timed out: {step}")]
    Timeout {
        /// The step that timed out.
        step: String,
    },
}

impl BrokerError {
    /// Stable string identifier for metrics and log filtering.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTarget { .. } => "invalid_target",
            Self::InvalidObserver => "invalid_observer",
            Self::NotFound { .. } => "not_found",
            Self::NotConnected => "not_connected",
            Self::AlreadyInState { .. } => "already_in_state",
            Self::UnexpectedState { .. } => "unexpected_state",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Errors surfaced by the client-side call container.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CallError {
    /// The descriptor is missing its package or component name.
    #[error("invalid call target: {uri}")]
    InvalidTarget {
        /// Canonical key of the offending descriptor.
        uri: String,
    },

    /// A call arrived without a completion callback.
    #[error("call carries no callback")]
    InvalidCallback,

    /// The callback could not be matched to any local call record.
    #[error("callback matches no local call record")]
    NotFound,

    /// The record has no connection adapter to release through.
    #[error("record has no live connection")]
    NoConnection,

    /// The external start service rejected the request.
    #[error("component start failed: {message}")]
    StartFailed {
        /// Error reported by the start service.
        message: String,
    },

    /// Local bookkeeping was removed but the external release call failed.
    #[error("external release failed after local cleanup: {message}")]
    ReleaseFailed {
        /// Error reported by the start service.
        message: String,
    },

    /// The remote process backing the target died before or after
    /// resolution.
    #[error("target died")]
    TargetDied,
}

impl CallError {
    /// Stable string identifier for metrics and log filtering.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTarget { .. } => "invalid_target",
            Self::InvalidCallback => "invalid_callback",
            Self::NotFound => "not_found",
            Self::NoConnection => "no_connection",
            Self::StartFailed { .. } => "start_failed",
            Self::ReleaseFailed { .. } => "release_failed",
            Self::TargetDied => "target_died",
        }
    }

    /// Returns `true` when local state was already cleaned up and only the
    /// external side may disagree.
    #[must_use]
    pub const fn is_local_state_clean(&self) -> bool {
        matches!(self, Self::ReleaseFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(BrokerError::NotConnected.kind(), "not_connected");
        assert_eq!(CallError::NotFound.kind(), "not_found");
        assert_eq!(
            CallError::ReleaseFailed {
                message: "io".into()
            }
            .kind(),
            "release_failed"
        );
    }

    #[test]
    fn test_release_failed_is_local_clean() {
        assert!(
            CallError::ReleaseFailed {
                message: "io".into()
            }
            .is_local_state_clean()
        );
        assert!(!CallError::TargetDied.is_local_state_clean());
    }
}
