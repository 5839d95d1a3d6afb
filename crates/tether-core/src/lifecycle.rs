//! Lifecycle state machines for targets and connections.
//!
//! A target moves `Initial -> Loading -> Inactivating -> Inactive`, then
//! between the active sub-states (`Inactive`, `Foreground`, `Background`)
//! via their in-flight transitions, and finally through `Terminating` to
//! `Gone`. Every in-flight state owns a timer on the broker side.
//!
//! A connection moves `Connecting -> Connected -> Disconnecting ->
//! Disconnected`; a forced disconnect (caller or target death) jumps
//! straight to `Disconnected`.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a target instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Record exists but nothing has been asked of the process yet.
    Initial,
    /// A load has been dispatched; waiting for the target thread to attach.
    Loading,
    /// Attached; waiting for the target to report itself inactive.
    Inactivating,
    /// Active and idle: ready for connect/command work.
    Inactive,
    /// A foreground move is in flight.
    Foregrounding,
    /// Active in the foreground.
    Foreground,
    /// A background move is in flight.
    Backgrounding,
    /// Active in the background.
    Background,
    /// Termination has been dispatched; waiting for the terminate report.
    Terminating,
    /// Terminal: the record is eligible for removal from every index.
    Gone,
}

impl LifecycleState {
    /// Returns whether the target is in any of the active sub-states.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Inactive | Self::Foreground | Self::Background
        )
    }

    /// Returns whether a transition is currently in flight.
    #[must_use]
    pub const fn is_transitioning(self) -> bool {
        matches!(
            self,
            Self::Loading
                | Self::Inactivating
                | Self::Foregrounding
                | Self::Backgrounding
                | Self::Terminating
        )
    }

    /// Short name used in logs and dump output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Loading => "LOADING",
            Self::Inactivating => "INACTIVATING",
            Self::Inactive => "INACTIVE",
            Self::Foregrounding => "FOREGROUNDING",
            Self::Foreground => "FOREGROUND",
            Self::Backgrounding => "BACKGROUNDING",
            Self::Background => "BACKGROUND",
            Self::Terminating => "TERMINATING",
            Self::Gone => "GONE",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State a target reports back through the transition-done entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedState {
    /// The target finished inactivating.
    Inactive,
    /// The target finished a foreground move.
    Foreground,
    /// The target finished a background move.
    Background,
    /// The target finished terminating.
    Initial,
}

impl ReportedState {
    /// The in-flight state a record must be in for this report to be valid.
    #[must_use]
    pub const fn expected(self) -> LifecycleState {
        match self {
            Self::Inactive => LifecycleState::Inactivating,
            Self::Foreground => LifecycleState::Foregrounding,
            Self::Background => LifecycleState::Backgrounding,
            Self::Initial => LifecycleState::Terminating,
        }
    }

    /// The state the record settles into when the report is accepted.
    #[must_use]
    pub const fn settled(self) -> LifecycleState {
        match self {
            Self::Inactive => LifecycleState::Inactive,
            Self::Foreground => LifecycleState::Foreground,
            Self::Background => LifecycleState::Background,
            Self::Initial => LifecycleState::Gone,
        }
    }
}

/// State of one caller's connection to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Accepted; waiting for the target to report connect-done.
    Connecting,
    /// Live.
    Connected,
    /// A graceful release is in flight.
    Disconnecting,
    /// Finished, gracefully or not.
    Disconnected,
}

impl ConnectionState {
    /// Short name used in logs and dump output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_substates() {
        assert!(LifecycleState::Inactive.is_active());
        assert!(LifecycleState::Foreground.is_active());
        assert!(LifecycleState::Background.is_active());
        assert!(!LifecycleState::Loading.is_active());
        assert!(!LifecycleState::Terminating.is_active());
    }

    #[test]
    fn test_report_expectations() {
        assert_eq!(
            ReportedState::Inactive.expected(),
            LifecycleState::Inactivating
        );
        assert_eq!(ReportedState::Initial.settled(), LifecycleState::Gone);
        assert_eq!(
            ReportedState::Background.settled(),
            LifecycleState::Background
        );
    }
}
