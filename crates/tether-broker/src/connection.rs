//! Connection records.
//!
//! One record per accepted connect request: the triple of target, caller,
//! and observer, plus the connection's own state machine. Records live in
//! the manager's arena and are mutated only under the manager lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tether_core::handle::{CallerToken, TargetToken};
use tether_core::lifecycle::ConnectionState;
use tether_core::observer::{ConnectionObserver, observer_key};

/// One caller's live or pending connection to one target instance.
pub struct ConnectionRecord {
    id: u64,
    target: TargetToken,
    caller: CallerToken,
    observer: Arc<dyn ConnectionObserver>,
    state: ConnectionState,
    /// Set when the record was completed without a graceful handshake.
    forced: bool,
}

impl ConnectionRecord {
    /// Creates a record in `Connecting` with a fresh stable id.
    pub fn new(
        target: TargetToken,
        caller: CallerToken,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            target,
            caller,
            observer,
            state: ConnectionState::Connecting,
            forced: false,
        }
    }

    /// Stable id, used as the timer key for the connect window.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Target this record is attached to, for its whole lifetime.
    #[must_use]
    pub const fn target(&self) -> TargetToken {
        self.target
    }

    /// Caller behind the request.
    #[must_use]
    pub const fn caller(&self) -> CallerToken {
        self.caller
    }

    /// The observer to notify on completion.
    #[must_use]
    pub fn observer(&self) -> Arc<dyn ConnectionObserver> {
        Arc::clone(&self.observer)
    }

    /// Lookup key of the observer.
    #[must_use]
    pub fn observer_key(&self) -> usize {
        observer_key(&self.observer)
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether this record finished without a graceful handshake.
    #[must_use]
    pub const fn was_forced(&self) -> bool {
        self.forced
    }

    /// Marks the connect handshake complete.
    pub fn complete_connect(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Begins a graceful disconnect.
    pub fn begin_disconnect(&mut self) {
        self.state = ConnectionState::Disconnecting;
    }

    /// Finishes the record. `forced` marks a non-graceful completion
    /// (caller death, target death, or timeout) that skipped
    /// `Disconnecting`.
    pub fn complete_disconnect(&mut self, forced: bool) {
        self.state = ConnectionState::Disconnected;
        self.forced = forced;
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("caller", &self.caller)
            .field("state", &self.state)
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tether_core::descriptor::Descriptor;
    use tether_core::handle::RemoteHandle;

    use super::*;

    struct NullObserver;

    impl ConnectionObserver for NullObserver {
        fn on_connect_done(&self, _: &Descriptor, _: RemoteHandle, _: i32) {}
        fn on_disconnect_done(&self, _: &Descriptor, _: i32) {}
    }

    #[test]
    fn test_graceful_path() {
        let observer: Arc<dyn ConnectionObserver> = Arc::new(NullObserver);
        let mut record =
            ConnectionRecord::new(TargetToken::next(), CallerToken::next(), observer);
        assert_eq!(record.state(), ConnectionState::Connecting);

        record.complete_connect();
        assert_eq!(record.state(), ConnectionState::Connected);

        record.begin_disconnect();
        assert_eq!(record.state(), ConnectionState::Disconnecting);

        record.complete_disconnect(false);
        assert_eq!(record.state(), ConnectionState::Disconnected);
        assert!(!record.was_forced());
    }

    #[test]
    fn test_forced_skips_disconnecting() {
        let observer: Arc<dyn ConnectionObserver> = Arc::new(NullObserver);
        let mut record =
            ConnectionRecord::new(TargetToken::next(), CallerToken::next(), observer);
        record.complete_connect();
        record.complete_disconnect(true);
        assert_eq!(record.state(), ConnectionState::Disconnected);
        assert!(record.was_forced());
    }
}
