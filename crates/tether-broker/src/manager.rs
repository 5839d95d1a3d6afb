//! The connection manager.
//!
//! Tracks every loaded-or-loading target, multiplexes connect requests onto
//! one instance each, and drives instances through their lifecycle. One
//! mutex serializes all mutation; external effects (dispatcher calls,
//! observer notifications) are collected under the lock and performed after
//! it is released, so collaborators can re-enter the manager freely.
//! Asynchronous events (death notifications, restart delays, deferred
//! completions) go through the work queue and are handled in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tether_core::config::TimeoutConfig;
use tether_core::death::{DeathNotificationSource, DeathRecipient};
use tether_core::descriptor::Descriptor;
use tether_core::error::BrokerError;
use tether_core::handle::{CallerToken, RemoteHandle, SchedulerHandle, TargetToken};
use tether_core::lifecycle::{ConnectionState, LifecycleState, ReportedState};
use tether_core::observer::{ConnectionObserver, DisconnectReason, LaunchClass, observer_key};
use tether_core::queue::WorkQueue;
use tether_core::restart::{RestartConfig, RestartManager};
use tether_core::session::SessionId;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionRecord;
use crate::dispatch::{DispatchOp, LifecycleDispatcher, TargetSnapshot};
use crate::target::TargetRecord;
use crate::timeout::{TimeoutKind, TimeoutScheduler};

/// Caller token the manager itself uses when it re-starts a keep-alive
/// target.
const FRAMEWORK_CALLER: CallerToken = CallerToken(0);

/// What a caller wants brought up.
#[derive(Debug, Clone)]
pub struct TargetRequest {
    /// The component to start or connect to.
    pub descriptor: Descriptor,
    /// Owning session; `None` means the manager's own session.
    pub session: Option<SessionId>,
    /// How the target serves callers, from resolved component metadata.
    pub launch_class: LaunchClass,
    /// Whether the framework restarts the target when it dies.
    pub keep_alive: bool,
}

impl TargetRequest {
    /// Request for a plain singleton service with no keep-alive policy.
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            session: None,
            launch_class: LaunchClass::Singleton,
            keep_alive: false,
        }
    }

    /// Sets the owning session.
    #[must_use]
    pub const fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the launch classification.
    #[must_use]
    pub const fn with_launch_class(mut self, class: LaunchClass) -> Self {
        self.launch_class = class;
        self
    }

    /// Marks the target keep-alive.
    #[must_use]
    pub const fn keep_alive(mut self) -> Self {
        self.keep_alive = true;
        self
    }
}

/// Manager construction knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-step timeout windows.
    pub timeouts: TimeoutConfig,
    /// Keep-alive restart policy.
    pub restart: RestartConfig,
    /// Session this manager serves; requests without an explicit session
    /// land here.
    pub session: SessionId,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            restart: RestartConfig::default(),
            session: SessionId(0),
        }
    }
}

/// Diagnostic view of one target, for running-info queries.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInfo {
    /// Canonical descriptor key.
    pub uri: String,
    /// Target token.
    pub token: u64,
    /// Lifecycle state name.
    pub state: String,
    /// Attached connection count.
    pub connections: usize,
    /// Owning session.
    pub session: i32,
}

struct QueuedStart {
    request: TargetRequest,
    caller: CallerToken,
}

#[derive(Default)]
struct ManagerState {
    targets: HashMap<TargetToken, TargetRecord>,
    /// uri -> token for live instances.
    service_index: HashMap<String, TargetToken>,
    /// uri -> token for instances whose termination is in flight.
    terminating_index: HashMap<String, TargetToken>,
    connections: HashMap<u64, ConnectionRecord>,
    /// observer key -> connection ids registered under that observer.
    by_observer: HashMap<usize, Vec<u64>>,
    /// Start requests coalesced behind an in-flight transition, per uri.
    queued_starts: HashMap<String, VecDeque<QueuedStart>>,
    /// Restart policy state per uri; survives record churn.
    restarts: HashMap<String, RestartManager>,
}

/// External effects computed under the lock, performed after it drops.
enum Effect {
    Dispatch(DispatchOp, TargetSnapshot),
    NotifyConnect {
        observer: Arc<dyn ConnectionObserver>,
        descriptor: Descriptor,
        handle: RemoteHandle,
        code: i32,
    },
    NotifyDisconnect {
        observer: Arc<dyn ConnectionObserver>,
        descriptor: Descriptor,
        code: i32,
    },
    /// Complete a connect against an already-connected target, ordered
    /// behind whatever the queue is doing.
    CompleteConnectLater(u64),
    /// Re-start a keep-alive target after its backoff delay.
    RestartAfter {
        request: TargetRequest,
        delay: Duration,
    },
}

/// Server-side connection manager.
pub struct ConnectionManager {
    state: Mutex<ManagerState>,
    dispatcher: Arc<dyn LifecycleDispatcher>,
    timeouts: TimeoutScheduler,
    queue: WorkQueue,
    config: ManagerConfig,
}

impl ConnectionManager {
    /// Creates a manager. Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn LifecycleDispatcher>, config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState::default()),
            dispatcher,
            timeouts: TimeoutScheduler::new(),
            queue: WorkQueue::new("connection-manager"),
            config,
        })
    }

    /// Subscribes to a death source; events are posted onto the manager
    /// queue and matched against live remote handles there.
    pub fn bind_death_source(self: &Arc<Self>, source: &dyn DeathNotificationSource) {
        let weak = Arc::downgrade(self);
        source.subscribe(DeathRecipient::new(move |identity| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let inner = Arc::downgrade(&manager);
            manager.queue.post(move || {
                let Some(manager) = inner.upgrade() else {
                    return;
                };
                let found = {
                    let state = manager.state.lock().expect("manager state poisoned");
                    state
                        .targets
                        .values()
                        .find(|t| t.remote().is_some_and(|r| r.identity() == identity))
                        .map(|t| (t.token(), t.session()))
                };
                if let Some((token, session)) = found {
                    manager.died_now(token, session);
                }
            });
        }));
    }

    // ------------------------------------------------------------------
    // Start / connect / disconnect
    // ------------------------------------------------------------------

    /// Starts (or commands) a target. Returns immediately; the actual start
    /// is asynchronous. Concurrent starts for one descriptor coalesce onto
    /// one record.
    pub fn start_component(
        self: &Arc<Self>,
        request: TargetRequest,
        caller: CallerToken,
    ) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            self.start_locked(&mut guard, request, caller, &mut effects)?;
        }
        self.run_effects(effects);
        Ok(())
    }

    /// Connects an observer to a target, creating and loading the target if
    /// needed. A repeat connect by the same observer to the same loaded
    /// target is accepted without a second connection record.
    pub fn connect_component(
        self: &Arc<Self>,
        request: TargetRequest,
        observer: Option<Arc<dyn ConnectionObserver>>,
        caller: CallerToken,
    ) -> Result<(), BrokerError> {
        let observer = observer.ok_or(BrokerError::InvalidObserver)?;
        if !request.descriptor.is_valid() {
            return Err(BrokerError::InvalidTarget {
                uri: request.descriptor.uri(),
            });
        }

        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let session = request.session.unwrap_or(self.config.session);
            let (token, loaded) = Self::get_or_create(
                state,
                &request,
                session,
                /* created_by_connect = */ true,
                &self.config.restart,
            );

            let okey = observer_key(&observer);
            let connections = &state.connections;
            let already = state.by_observer.get(&okey).is_some_and(|ids| {
                ids.iter().any(|id| {
                    connections.get(id).is_some_and(|c| {
                        c.target() == token && c.state() != ConnectionState::Disconnected
                    })
                })
            });
            if loaded && already {
                debug!(token = %token, "observer already connected, coalescing");
                return Ok(());
            }

            let record = ConnectionRecord::new(token, caller, Arc::clone(&observer));
            let conn_id = record.id();
            state.connections.insert(conn_id, record);
            state.by_observer.entry(okey).or_default().push(conn_id);
            let target = state
                .targets
                .get_mut(&token)
                .expect("created target must exist");
            target.attach_connection(conn_id);
            info!(token = %token, conn_id, uri = %target.uri(), "connect accepted");

            if loaded {
                let target = state.targets.get(&token).expect("target must exist");
                if target.state().is_active() {
                    if target.connections().len() > 1 {
                        if target.remote().is_some() {
                            // Target is already connected; complete this
                            // record from the queue so ordering is kept.
                            effects.push(Effect::CompleteConnectLater(conn_id));
                        } else {
                            debug!(token = %token, "target connecting, waiting for connect-done");
                        }
                    } else {
                        self.dispatch_connect_locked(state, token, &mut effects);
                    }
                } else {
                    debug!(token = %token, "target still transitioning, connect waits on load");
                }
            } else {
                self.load_locked(state, token, &mut effects);
            }
        }
        self.run_effects(effects);
        Ok(())
    }

    /// Disconnects every connection registered under `observer`.
    pub fn disconnect_component(
        self: &Arc<Self>,
        observer: &Arc<dyn ConnectionObserver>,
    ) -> Result<(), BrokerError> {
        let okey = observer_key(observer);
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let ids = state.by_observer.get(&okey).cloned().unwrap_or_default();
            if ids.is_empty() {
                return Err(BrokerError::NotConnected);
            }

            let mut touched = Vec::new();
            for id in ids {
                let Some(conn) = state.connections.get(&id) else {
                    continue;
                };
                if conn.state() == ConnectionState::Disconnected {
                    continue;
                }
                let token = conn.target();
                touched.push(token);
                let can_handshake = state
                    .targets
                    .get(&token)
                    .is_some_and(|t| t.state().is_active() && t.remote().is_some());
                if can_handshake {
                    let conn = state
                        .connections
                        .get_mut(&id)
                        .expect("connection must exist");
                    conn.begin_disconnect();
                    let snapshot = state
                        .targets
                        .get(&token)
                        .expect("target must exist")
                        .snapshot();
                    effects.push(Effect::Dispatch(DispatchOp::Disconnect, snapshot));
                } else {
                    // Nothing to hand the disconnect to; complete in place.
                    self.finish_connection_locked(
                        state,
                        id,
                        false,
                        DisconnectReason::Graceful,
                        &mut effects,
                    );
                }
            }
            for token in touched {
                self.maybe_terminate_locked(state, token, &mut effects);
            }
        }
        self.run_effects(effects);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion entry points (called by the target side)
    // ------------------------------------------------------------------

    /// Binds a freshly started target's scheduling handle and asks it to
    /// settle into the inactive state. Cancels the load window.
    pub fn attach_component_thread(
        self: &Arc<Self>,
        scheduler: SchedulerHandle,
        token: TargetToken,
    ) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let target = guard
                .targets
                .get_mut(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            if target.state() != LifecycleState::Loading {
                return Err(BrokerError::UnexpectedState {
                    expected: LifecycleState::Loading.as_str().to_string(),
                    actual: target.state().as_str().to_string(),
                });
            }
            self.timeouts.cancel(TimeoutKind::Load, token.0);
            target.attach_scheduler(scheduler);
            target.set_state(LifecycleState::Inactivating);
            info!(token = %token, uri = %target.uri(), "target attached");
            effects.push(Effect::Dispatch(DispatchOp::Inactivate, target.snapshot()));
            self.arm_timeout(TimeoutKind::Inactive, token.0, self.config.timeouts.inactive);
        }
        self.run_effects(effects);
        Ok(())
    }

    /// Validates a lifecycle transition report and advances the record.
    ///
    /// An inactive report drains the work that queued up behind the load:
    /// pending connects for connection-created records, the start command
    /// (plus any pending connects) otherwise.
    pub fn transition_done(
        self: &Arc<Self>,
        token: TargetToken,
        reported: ReportedState,
    ) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let target = state
                .targets
                .get_mut(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            let expected = reported.expected();
            if target.state() != expected {
                if target.state() == reported.settled() {
                    return Err(BrokerError::AlreadyInState {
                        state: target.state().as_str().to_string(),
                    });
                }
                return Err(BrokerError::UnexpectedState {
                    expected: expected.as_str().to_string(),
                    actual: target.state().as_str().to_string(),
                });
            }
            target.set_state(reported.settled());
            debug!(token = %token, state = %target.state(), "transition settled");

            match reported {
                ReportedState::Inactive => {
                    self.timeouts.cancel(TimeoutKind::Inactive, token.0);
                    let created_by_connect = target.created_by_connect();
                    let connections = &state.connections;
                    let has_waiters = target.connections().iter().any(|id| {
                        connections
                            .get(id)
                            .is_some_and(|c| c.state() == ConnectionState::Connecting)
                    });
                    if created_by_connect {
                        self.dispatch_connect_locked(state, token, &mut effects);
                    } else {
                        self.dispatch_command_locked(state, token, &mut effects);
                        if has_waiters {
                            // Someone connected while the load was in flight.
                            self.dispatch_connect_locked(state, token, &mut effects);
                        }
                    }
                },
                ReportedState::Foreground => {
                    self.timeouts.cancel(TimeoutKind::Foreground, token.0);
                    self.drain_queued_starts_locked(state, token, &mut effects);
                },
                ReportedState::Background => {
                    self.timeouts.cancel(TimeoutKind::Background, token.0);
                },
                ReportedState::Initial => {
                    self.timeouts.cancel(TimeoutKind::Terminate, token.0);
                    self.terminate_done_locked(state, token);
                },
            }
        }
        self.run_effects(effects);
        Ok(())
    }

    /// The target produced its callable handle: completes every waiting
    /// connection and cancels their connect windows.
    pub fn connect_done(
        self: &Arc<Self>,
        token: TargetToken,
        remote: RemoteHandle,
    ) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let target = state
                .targets
                .get_mut(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            if !target.state().is_active() {
                return Err(BrokerError::UnexpectedState {
                    expected: LifecycleState::Inactive.as_str().to_string(),
                    actual: target.state().as_str().to_string(),
                });
            }
            target.set_remote(Some(remote.clone()));
            let descriptor = target.descriptor().clone();
            let code = target.launch_class().code();
            let conn_ids: Vec<u64> = target.connections().to_vec();
            info!(token = %token, uri = %descriptor, "connect done");
            for id in conn_ids {
                let Some(conn) = state.connections.get_mut(&id) else {
                    continue;
                };
                if conn.state() != ConnectionState::Connecting {
                    continue;
                }
                conn.complete_connect();
                self.timeouts.cancel(TimeoutKind::Connect, id);
                effects.push(Effect::NotifyConnect {
                    observer: conn.observer(),
                    descriptor: descriptor.clone(),
                    handle: remote.clone(),
                    code,
                });
            }
        }
        self.run_effects(effects);
        Ok(())
    }

    /// The target acknowledged a disconnect: completes the in-flight
    /// record and schedules termination if the target became idle.
    pub fn disconnect_done(self: &Arc<Self>, token: TargetToken) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let target = state
                .targets
                .get(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            let connections = &state.connections;
            let disconnecting = target.connections().iter().copied().find(|id| {
                connections
                    .get(id)
                    .is_some_and(|c| c.state() == ConnectionState::Disconnecting)
            });
            let Some(conn_id) = disconnecting else {
                return Err(BrokerError::NotConnected);
            };
            self.finish_connection_locked(
                state,
                conn_id,
                false,
                DisconnectReason::Graceful,
                &mut effects,
            );
            self.maybe_terminate_locked(state, token, &mut effects);
        }
        self.run_effects(effects);
        Ok(())
    }

    /// The target finished a start command: settles it active and drains
    /// queued start requests for the same descriptor.
    pub fn command_done(self: &Arc<Self>, token: TargetToken) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let target = state
                .targets
                .get(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            if !target.state().is_active() {
                return Err(BrokerError::UnexpectedState {
                    expected: LifecycleState::Inactive.as_str().to_string(),
                    actual: target.state().as_str().to_string(),
                });
            }
            self.timeouts.cancel(TimeoutKind::Command, token.0);
            self.drain_queued_starts_locked(state, token, &mut effects);
        }
        self.run_effects(effects);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Foreground / background / terminate
    // ------------------------------------------------------------------

    /// Asks an active target to move to the foreground.
    pub fn move_to_foreground(self: &Arc<Self>, token: TargetToken) -> Result<(), BrokerError> {
        self.move_locked(token, DispatchOp::Foreground)
    }

    /// Asks an active target to move to the background.
    pub fn move_to_background(self: &Arc<Self>, token: TargetToken) -> Result<(), BrokerError> {
        self.move_locked(token, DispatchOp::Background)
    }

    /// Terminates a target instance, force-completing whatever is still
    /// attached to it.
    pub fn terminate_component(self: &Arc<Self>, token: TargetToken) -> Result<(), BrokerError> {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let target = state
                .targets
                .get(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            if matches!(
                target.state(),
                LifecycleState::Terminating | LifecycleState::Gone
            ) {
                debug!(token = %token, "terminate requested while already terminating");
                return Ok(());
            }
            let conn_ids: Vec<u64> = target.connections().to_vec();
            for id in conn_ids {
                self.finish_connection_locked(
                    state,
                    id,
                    true,
                    DisconnectReason::Graceful,
                    &mut effects,
                );
            }
            self.begin_terminate_locked(state, token, &mut effects);
        }
        self.run_effects(effects);
        Ok(())
    }

    /// Stops a target by descriptor. Fails with `NotFound` when no live
    /// instance serves the descriptor.
    pub fn stop_component(self: &Arc<Self>, descriptor: &Descriptor) -> Result<(), BrokerError> {
        let token = {
            let state = self.state.lock().expect("manager state poisoned");
            state.service_index.get(&descriptor.uri()).copied()
        };
        match token {
            Some(token) => self.terminate_component(token),
            None => Err(BrokerError::NotFound {
                what: descriptor.uri(),
            }),
        }
    }

    /// Synchronously asks the target whether termination may proceed,
    /// bounded by the configured deadline. The query runs on the manager
    /// queue; on deadline expiry the default answer (`true`) is returned.
    ///
    /// Call from a thread that is not driving the tokio runtime.
    #[must_use]
    pub fn prepare_terminate(&self, token: TargetToken) -> bool {
        let snapshot = {
            let state = self.state.lock().expect("manager state poisoned");
            state.targets.get(&token).map(TargetRecord::snapshot)
        };
        let Some(snapshot) = snapshot else {
            return true;
        };
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let dispatcher = Arc::clone(&self.dispatcher);
        self.queue.post(move || {
            let _ = tx.send(dispatcher.prepare_terminate(&snapshot));
        });
        rx.recv_timeout(self.config.timeouts.prepare_terminate)
            .unwrap_or_else(|_| {
                warn!(token = %token, "prepare-terminate deadline expired, using default");
                true
            })
    }

    // ------------------------------------------------------------------
    // Death and timeout handling
    // ------------------------------------------------------------------

    /// Reports that the process behind `token` died. The event is posted
    /// onto the manager queue; reclamation happens there.
    pub fn on_component_died(self: &Arc<Self>, token: TargetToken, session: SessionId) {
        let weak = Arc::downgrade(self);
        self.queue.post(move || {
            if let Some(manager) = weak.upgrade() {
                manager.died_now(token, session);
            }
        });
    }

    /// Reports that a caller observer died: all of its connections are
    /// force-disconnected and idle targets are reclaimed.
    pub fn on_observer_died(self: &Arc<Self>, observer: &Arc<dyn ConnectionObserver>) {
        let okey = observer_key(observer);
        let weak = Arc::downgrade(self);
        self.queue.post(move || {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let mut effects = Vec::new();
            {
                let mut guard = manager.state.lock().expect("manager state poisoned");
                let state = &mut *guard;
                let ids = state.by_observer.get(&okey).cloned().unwrap_or_default();
                if ids.is_empty() {
                    return;
                }
                info!(connections = ids.len(), "caller died, reclaiming connections");
                let mut touched = Vec::new();
                for id in ids {
                    if let Some(conn) = state.connections.get(&id) {
                        touched.push(conn.target());
                    }
                    manager.finish_connection_locked(
                        state,
                        id,
                        true,
                        DisconnectReason::CallerDied,
                        &mut effects,
                    );
                }
                for token in touched {
                    manager.maybe_terminate_locked(state, token, &mut effects);
                }
            }
            manager.run_effects(effects);
        });
    }

    /// Handles a fired lifecycle timer. `id` is the connection record id
    /// for `Connect` timers and the target token for everything else.
    pub fn on_timeout(self: &Arc<Self>, kind: TimeoutKind, id: u64) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            match kind {
                TimeoutKind::Load => {
                    self.load_timeout_locked(state, TargetToken(id), &mut effects);
                },
                TimeoutKind::Connect => {
                    let Some(conn) = state.connections.get(&id) else {
                        return;
                    };
                    if conn.state() != ConnectionState::Connecting {
                        return;
                    }
                    let token = conn.target();
                    error!(conn_id = id, "connect timed out, operational freeze suspected");
                    self.finish_connection_locked(
                        state,
                        id,
                        true,
                        DisconnectReason::TimedOut,
                        &mut effects,
                    );
                    self.maybe_terminate_locked(state, token, &mut effects);
                },
                TimeoutKind::Command => {
                    error!(token = id, "command timed out, operational freeze suspected");
                },
                TimeoutKind::Inactive => {
                    error!(token = id, "inactivate timed out, operational freeze suspected");
                },
                TimeoutKind::Foreground => {
                    let token = TargetToken(id);
                    error!(%token, "foreground move timed out, failing in-flight request");
                    if let Some(target) = state.targets.get_mut(&token) {
                        if target.state() == LifecycleState::Foregrounding {
                            target.set_state(LifecycleState::Inactive);
                        }
                    }
                    self.drain_queued_starts_locked(state, token, &mut effects);
                },
                TimeoutKind::Background => {
                    let token = TargetToken(id);
                    warn!(%token, "background move timed out, settling");
                    if let Some(target) = state.targets.get_mut(&token) {
                        if target.state() == LifecycleState::Backgrounding {
                            target.set_state(LifecycleState::Background);
                        }
                    }
                },
                TimeoutKind::Terminate => {
                    let token = TargetToken(id);
                    warn!(%token, "terminate timed out, reclaiming record");
                    if state
                        .targets
                        .get(&token)
                        .is_some_and(|t| t.state() == LifecycleState::Terminating)
                    {
                        self.terminate_done_locked(state, token);
                    }
                },
                TimeoutKind::QueuedStart => {
                    let token = TargetToken(id);
                    let uri = state.targets.get(&token).map(TargetRecord::uri);
                    if let Some(uri) = uri {
                        if let Some(dropped) = state.queued_starts.remove(&uri) {
                            error!(
                                %uri,
                                dropped = dropped.len(),
                                "queued start requests timed out waiting for load"
                            );
                        }
                    }
                },
            }
        }
        self.run_effects(effects);
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// One line per target plus one per attached connection.
    #[must_use]
    pub fn dump_state(&self) -> Vec<String> {
        let state = self.state.lock().expect("manager state poisoned");
        let mut lines = Vec::new();
        for (uri, token) in &state.service_index {
            let Some(target) = state.targets.get(token) else {
                continue;
            };
            lines.push(format!(
                "  TargetRecord {} uri[{}] state #{} connections #{}",
                target.token(),
                uri,
                target.state(),
                target.connections().len()
            ));
            for id in target.connections() {
                if let Some(conn) = state.connections.get(id) {
                    lines.push(format!(
                        "    ConnectionRecord #{} caller[{}] state #{}",
                        conn.id(),
                        conn.caller(),
                        conn.state()
                    ));
                }
            }
        }
        lines
    }

    /// Structured diagnostic snapshot of every live target.
    #[must_use]
    pub fn running_infos(&self) -> Vec<RunningInfo> {
        let state = self.state.lock().expect("manager state poisoned");
        state
            .service_index
            .values()
            .filter_map(|token| state.targets.get(token))
            .map(|target| RunningInfo {
                uri: target.uri(),
                token: target.token().0,
                state: target.state().as_str().to_string(),
                connections: target.connections().len(),
                session: target.session().0,
            })
            .collect()
    }

    /// Looks up the live target serving `descriptor`, if any.
    #[must_use]
    pub fn target_by_descriptor(&self, descriptor: &Descriptor) -> Option<TargetToken> {
        let state = self.state.lock().expect("manager state poisoned");
        state.service_index.get(&descriptor.uri()).copied()
    }

    /// Number of lifecycle timers currently armed, for diagnostics.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.timeouts.armed()
    }

    // ------------------------------------------------------------------
    // Internal helpers (all called with the state lock held)
    // ------------------------------------------------------------------

    fn start_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        request: TargetRequest,
        caller: CallerToken,
        effects: &mut Vec<Effect>,
    ) -> Result<(), BrokerError> {
        if !request.descriptor.is_valid() {
            return Err(BrokerError::InvalidTarget {
                uri: request.descriptor.uri(),
            });
        }
        let session = request.session.unwrap_or(self.config.session);
        let (token, loaded) = Self::get_or_create(
            state,
            &request,
            session,
            /* created_by_connect = */ false,
            &self.config.restart,
        );
        let target_state = state
            .targets
            .get(&token)
            .map(TargetRecord::state)
            .expect("target must exist");

        if !loaded {
            self.load_locked(state, token, effects);
        } else if target_state.is_active() {
            self.dispatch_command_locked(state, token, effects);
        } else {
            // Already starting; coalesce behind the in-flight transition.
            let uri = request.descriptor.uri();
            let first = !state.queued_starts.contains_key(&uri);
            state
                .queued_starts
                .entry(uri.clone())
                .or_default()
                .push_back(QueuedStart { request, caller });
            debug!(%uri, "start coalesced behind in-flight transition");
            if first {
                self.arm_timeout(
                    TimeoutKind::QueuedStart,
                    token.0,
                    self.config.timeouts.queued_start,
                );
            }
        }
        Ok(())
    }

    fn get_or_create(
        state: &mut ManagerState,
        request: &TargetRequest,
        session: SessionId,
        created_by_connect: bool,
        restart_config: &RestartConfig,
    ) -> (TargetToken, bool) {
        let uri = request.descriptor.uri();
        if let Some(token) = state.service_index.get(&uri) {
            return (*token, true);
        }
        let record = TargetRecord::new(
            request.descriptor.clone(),
            session,
            request.launch_class,
            created_by_connect,
            request.keep_alive,
        );
        let token = record.token();
        if request.keep_alive {
            state
                .restarts
                .entry(uri.clone())
                .or_insert_with(|| RestartManager::new(restart_config.clone()));
        }
        state.service_index.insert(uri, token);
        state.targets.insert(token, record);
        (token, false)
    }

    fn load_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let target = state.targets.get_mut(&token).expect("target must exist");
        target.set_state(LifecycleState::Loading);
        info!(token = %token, uri = %target.uri(), "dispatching load");
        effects.push(Effect::Dispatch(DispatchOp::Load, target.snapshot()));
        self.arm_timeout(TimeoutKind::Load, token.0, self.config.timeouts.load);
    }

    fn dispatch_connect_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let Some(target) = state.targets.get(&token) else {
            return;
        };
        let snapshot = target.snapshot();
        let connections = &state.connections;
        let connecting: Vec<u64> = target
            .connections()
            .iter()
            .copied()
            .filter(|id| {
                connections
                    .get(id)
                    .is_some_and(|c| c.state() == ConnectionState::Connecting)
            })
            .collect();
        if connecting.is_empty() {
            return;
        }
        for id in &connecting {
            self.arm_timeout(TimeoutKind::Connect, *id, self.config.timeouts.connect);
        }
        effects.push(Effect::Dispatch(DispatchOp::Connect, snapshot));
    }

    fn dispatch_command_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let Some(target) = state.targets.get_mut(&token) else {
            return;
        };
        target.add_start();
        effects.push(Effect::Dispatch(DispatchOp::Command, target.snapshot()));
        self.arm_timeout(TimeoutKind::Command, token.0, self.config.timeouts.command);
    }

    fn move_locked(
        self: &Arc<Self>,
        token: TargetToken,
        op: DispatchOp,
    ) -> Result<(), BrokerError> {
        let (goal, in_flight, kind, window) = match op {
            DispatchOp::Foreground => (
                LifecycleState::Foreground,
                LifecycleState::Foregrounding,
                TimeoutKind::Foreground,
                self.config.timeouts.foreground,
            ),
            _ => (
                LifecycleState::Background,
                LifecycleState::Backgrounding,
                TimeoutKind::Background,
                self.config.timeouts.background,
            ),
        };
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let target = guard
                .targets
                .get_mut(&token)
                .ok_or_else(|| BrokerError::NotFound {
                    what: token.to_string(),
                })?;
            if target.state() == goal {
                return Err(BrokerError::AlreadyInState {
                    state: goal.as_str().to_string(),
                });
            }
            if !target.state().is_active() {
                return Err(BrokerError::UnexpectedState {
                    expected: LifecycleState::Inactive.as_str().to_string(),
                    actual: target.state().as_str().to_string(),
                });
            }
            target.set_state(in_flight);
            effects.push(Effect::Dispatch(op, target.snapshot()));
            self.arm_timeout(kind, token.0, window);
        }
        self.run_effects(effects);
        Ok(())
    }

    fn drain_queued_starts_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let Some(uri) = state.targets.get(&token).map(TargetRecord::uri) else {
            return;
        };
        let Some(queued) = state.queued_starts.remove(&uri) else {
            return;
        };
        self.timeouts.cancel(TimeoutKind::QueuedStart, token.0);
        info!(%uri, drained = queued.len(), "draining queued start requests");
        for entry in queued {
            if let Err(err) = self.start_locked(state, entry.request, entry.caller, effects) {
                warn!(%uri, error = %err, "queued start failed on drain");
            }
        }
    }

    /// Completes a connection record and removes it from every index.
    fn finish_connection_locked(
        &self,
        state: &mut ManagerState,
        conn_id: u64,
        forced: bool,
        reason: DisconnectReason,
        effects: &mut Vec<Effect>,
    ) {
        let Some(conn) = state.connections.get_mut(&conn_id) else {
            return;
        };
        if conn.state() == ConnectionState::Disconnected {
            return;
        }
        conn.complete_disconnect(forced);
        self.timeouts.cancel(TimeoutKind::Connect, conn_id);
        let observer = conn.observer();
        let okey = conn.observer_key();
        let token = conn.target();
        let descriptor = state
            .targets
            .get(&token)
            .map(|t| t.descriptor().clone())
            .unwrap_or_default();
        effects.push(Effect::NotifyDisconnect {
            observer,
            descriptor,
            code: reason.code(),
        });

        state.connections.remove(&conn_id);
        if let Some(target) = state.targets.get_mut(&token) {
            target.detach_connection(conn_id);
        }
        if let Some(ids) = state.by_observer.get_mut(&okey) {
            ids.retain(|id| *id != conn_id);
            if ids.is_empty() {
                state.by_observer.remove(&okey);
            }
        }
    }

    fn maybe_terminate_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let queued_starts = &state.queued_starts;
        let eligible = state.targets.get(&token).is_some_and(|t| {
            t.termination_eligible()
                && !matches!(
                    t.state(),
                    LifecycleState::Terminating | LifecycleState::Gone
                )
                && !queued_starts.contains_key(&t.uri())
        });
        if eligible {
            info!(token = %token, "idle connection-created target, terminating");
            self.begin_terminate_locked(state, token, effects);
        }
    }

    fn begin_terminate_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let Some(target) = state.targets.get_mut(&token) else {
            return;
        };
        let uri = target.uri();
        state.service_index.remove(&uri);
        state.terminating_index.insert(uri, token);
        target.set_state(LifecycleState::Terminating);
        effects.push(Effect::Dispatch(DispatchOp::Terminate, target.snapshot()));
        self.arm_timeout(TimeoutKind::Terminate, token.0, self.config.timeouts.terminate);
    }

    fn terminate_done_locked(&self, state: &mut ManagerState, token: TargetToken) {
        if let Some(target) = state.targets.remove(&token) {
            let uri = target.uri();
            state.terminating_index.remove(&uri);
            state.service_index.retain(|_, t| *t != token);
            info!(token = %token, %uri, "target gone");
        }
    }

    fn load_timeout_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        token: TargetToken,
        effects: &mut Vec<Effect>,
    ) {
        let Some(target) = state.targets.get(&token) else {
            return;
        };
        if target.state() != LifecycleState::Loading {
            return;
        }
        let uri = target.uri();
        error!(token = %token, %uri, "load timed out, failing in-flight requests");
        let conn_ids: Vec<u64> = target.connections().to_vec();
        for id in conn_ids {
            self.finish_connection_locked(state, id, true, DisconnectReason::TimedOut, effects);
        }
        state.service_index.remove(&uri);
        state.queued_starts.remove(&uri);
        self.timeouts.cancel(TimeoutKind::QueuedStart, token.0);
        if let Some(removed) = state.targets.remove(&token) {
            if removed.keep_alive() {
                self.schedule_restart_locked(state, &removed, None, effects);
            }
        }
    }

    fn died_now(self: &Arc<Self>, token: TargetToken, session: SessionId) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let Some(target) = state.targets.get_mut(&token) else {
                return;
            };
            let uri = target.uri();
            warn!(token = %token, %uri, %session, "target died, reclaiming");
            target.set_remote(None);

            let conn_ids: Vec<u64> = target.connections().to_vec();
            for id in conn_ids {
                self.finish_connection_locked(
                    state,
                    id,
                    true,
                    DisconnectReason::TargetDied,
                    &mut effects,
                );
            }
            self.cancel_target_timers(token);
            state.service_index.remove(&uri);
            state.terminating_index.remove(&uri);
            if let Some(removed) = state.targets.remove(&token) {
                if removed.keep_alive() {
                    let uptime = removed.uptime();
                    self.schedule_restart_locked(state, &removed, uptime, &mut effects);
                }
            }
        }
        self.run_effects(effects);
    }

    fn schedule_restart_locked(
        &self,
        state: &mut ManagerState,
        removed: &TargetRecord,
        uptime: Option<Duration>,
        effects: &mut Vec<Effect>,
    ) {
        let uri = removed.uri();
        let restart_config = self.config.restart.clone();
        let policy = state
            .restarts
            .entry(uri.clone())
            .or_insert_with(|| RestartManager::new(restart_config));
        if uptime.is_some_and(|u| u >= self.config.restart.min_uptime) {
            policy.record_success();
        }
        if !policy.should_restart() {
            warn!(%uri, "keep-alive restart suppressed by policy");
            return;
        }
        let delay = policy.record_restart();
        info!(%uri, ?delay, "scheduling keep-alive restart");
        effects.push(Effect::RestartAfter {
            request: TargetRequest {
                descriptor: removed.descriptor().clone(),
                session: Some(removed.session()),
                launch_class: removed.launch_class(),
                keep_alive: true,
            },
            delay,
        });
    }

    fn cancel_target_timers(&self, token: TargetToken) {
        for kind in [
            TimeoutKind::Load,
            TimeoutKind::Command,
            TimeoutKind::Inactive,
            TimeoutKind::Foreground,
            TimeoutKind::Background,
            TimeoutKind::Terminate,
            TimeoutKind::QueuedStart,
        ] {
            self.timeouts.cancel(kind, token.0);
        }
    }

    fn arm_timeout(self: &Arc<Self>, kind: TimeoutKind, id: u64, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.timeouts.arm(kind, id, delay, move || {
            if let Some(manager) = weak.upgrade() {
                manager.on_timeout(kind, id);
            }
        });
    }

    fn complete_queued_connect(self: &Arc<Self>, conn_id: u64) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().expect("manager state poisoned");
            let state = &mut *guard;
            let Some(conn) = state.connections.get(&conn_id) else {
                return;
            };
            if conn.state() != ConnectionState::Connecting {
                return;
            }
            let token = conn.target();
            let ready = state.targets.get(&token).and_then(|t| {
                t.remote()
                    .map(|r| (t.descriptor().clone(), r.clone(), t.launch_class().code()))
            });
            let Some((descriptor, handle, code)) = ready else {
                // The remote went away in the meantime; the connect window
                // timer will reclaim the record.
                return;
            };
            let conn = state
                .connections
                .get_mut(&conn_id)
                .expect("connection must exist");
            conn.complete_connect();
            self.timeouts.cancel(TimeoutKind::Connect, conn_id);
            effects.push(Effect::NotifyConnect {
                observer: conn.observer(),
                descriptor,
                handle,
                code,
            });
        }
        self.run_effects(effects);
    }

    fn run_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Dispatch(op, snapshot) => {
                    debug!(op = op.as_str(), token = %snapshot.token, "dispatching");
                    self.dispatcher.dispatch(op, &snapshot);
                },
                Effect::NotifyConnect {
                    observer,
                    descriptor,
                    handle,
                    code,
                } => observer.on_connect_done(&descriptor, handle, code),
                Effect::NotifyDisconnect {
                    observer,
                    descriptor,
                    code,
                } => observer.on_disconnect_done(&descriptor, code),
                Effect::CompleteConnectLater(conn_id) => {
                    let weak = Arc::downgrade(self);
                    self.queue.post(move || {
                        if let Some(manager) = weak.upgrade() {
                            manager.complete_queued_connect(conn_id);
                        }
                    });
                },
                Effect::RestartAfter { request, delay } => {
                    let weak = Arc::downgrade(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let Some(manager) = weak.upgrade() else {
                            return;
                        };
                        let posted = Arc::clone(&manager);
                        manager.queue.post(move || {
                            if let Err(err) = posted.start_component(request, FRAMEWORK_CALLER) {
                                error!(error = %err, "keep-alive restart failed");
                            }
                        });
                    });
                },
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("manager state poisoned");
        f.debug_struct("ConnectionManager")
            .field("targets", &state.targets.len())
            .field("connections", &state.connections.len())
            .finish_non_exhaustive()
    }
}
