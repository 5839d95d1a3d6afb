//! Target records.
//!
//! One record per loaded-or-loading target instance. Records are owned by
//! the manager's arena, keyed by token, and indexed by descriptor uri in
//! either the active or the terminating table.

use std::time::Instant;

use tether_core::descriptor::Descriptor;
use tether_core::handle::{RemoteHandle, SchedulerHandle, TargetToken};
use tether_core::lifecycle::LifecycleState;
use tether_core::observer::LaunchClass;
use tether_core::session::SessionId;

use crate::dispatch::TargetSnapshot;

/// One loaded-or-loading target instance.
#[derive(Debug)]
pub struct TargetRecord {
    token: TargetToken,
    descriptor: Descriptor,
    session: SessionId,
    state: LifecycleState,
    launch_class: LaunchClass,
    /// Ids of attached connection records, in attach order.
    connections: Vec<u64>,
    /// Whether the record was created by a connect rather than a start.
    created_by_connect: bool,
    /// Whether the framework restarts this target when it dies.
    keep_alive: bool,
    /// Commands delivered so far; a connection-created record that never
    /// took a command terminates once its last connection detaches.
    start_count: u32,
    remote: Option<RemoteHandle>,
    scheduler: Option<SchedulerHandle>,
    /// When the load was dispatched, for keep-alive uptime accounting.
    loaded_at: Option<Instant>,
}

impl TargetRecord {
    /// Creates a record in `Initial`.
    pub fn new(
        descriptor: Descriptor,
        session: SessionId,
        launch_class: LaunchClass,
        created_by_connect: bool,
        keep_alive: bool,
    ) -> Self {
        Self {
            token: TargetToken::next(),
            descriptor,
            session,
            state: LifecycleState::Initial,
            launch_class,
            connections: Vec::new(),
            created_by_connect,
            keep_alive,
            start_count: 0,
            remote: None,
            scheduler: None,
            loaded_at: None,
        }
    }

    /// Token identifying this instance.
    #[must_use]
    pub const fn token(&self) -> TargetToken {
        self.token
    }

    /// Descriptor the instance serves.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Canonical index key.
    #[must_use]
    pub fn uri(&self) -> String {
        self.descriptor.uri()
    }

    /// Session that owns the instance.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Sets the lifecycle state.
    pub fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    /// How the target serves callers, delivered on connect-done.
    #[must_use]
    pub const fn launch_class(&self) -> LaunchClass {
        self.launch_class
    }

    /// Whether the record was created by a connect request.
    #[must_use]
    pub const fn created_by_connect(&self) -> bool {
        self.created_by_connect
    }

    /// Whether the framework restarts this target on death.
    #[must_use]
    pub const fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Commands delivered so far.
    #[must_use]
    pub const fn start_count(&self) -> u32 {
        self.start_count
    }

    /// Counts a delivered command and returns the new count.
    pub fn add_start(&mut self) -> u32 {
        self.start_count += 1;
        self.start_count
    }

    /// Attached connection ids, in attach order.
    #[must_use]
    pub fn connections(&self) -> &[u64] {
        &self.connections
    }

    /// Attaches a connection record.
    pub fn attach_connection(&mut self, id: u64) {
        self.connections.push(id);
    }

    /// Detaches a connection record.
    pub fn detach_connection(&mut self, id: u64) {
        self.connections.retain(|c| *c != id);
    }

    /// Whether no connections remain attached.
    #[must_use]
    pub fn connections_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Eligibility for termination: connection-created, nothing attached,
    /// and no command keeping it alive.
    #[must_use]
    pub fn termination_eligible(&self) -> bool {
        self.created_by_connect && self.connections.is_empty() && self.start_count == 0
    }

    /// Remote handle produced by connect-done, if any.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteHandle> {
        self.remote.as_ref()
    }

    /// Sets or clears the remote handle.
    pub fn set_remote(&mut self, remote: Option<RemoteHandle>) {
        self.remote = remote;
    }

    /// Scheduler handle bound at attach, if the target has attached.
    #[must_use]
    pub const fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    /// Binds the scheduler handle and stamps the load time.
    pub fn attach_scheduler(&mut self, scheduler: SchedulerHandle) {
        self.scheduler = Some(scheduler);
        self.loaded_at = Some(Instant::now());
    }

    /// Uptime since attach, if the target ever attached.
    #[must_use]
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.loaded_at.map(|at| at.elapsed())
    }

    /// Snapshot handed to the dispatcher.
    #[must_use]
    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            token: self.token,
            descriptor: self.descriptor.clone(),
            state: self.state,
            scheduler: self.scheduler.clone(),
        }
    }
}
