//! The local call container.
//!
//! Owns every local call record, the adapters that receive remote
//! lifecycle notifications, and the call/release entry points. Records
//! commit to the singleton or per-session index only once the target
//! reports its classification; until then they are reachable through the
//! in-flight adapter set, which is also what unwinds an attempt the start
//! service rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tether_core::death::{DeathNotificationSource, DeathRecipient};
use tether_core::descriptor::Descriptor;
use tether_core::error::CallError;
use tether_core::handle::{CallerToken, HandleIdentity, RemoteHandle};
use tether_core::observer::{ConnectionObserver, LaunchClass};
use tether_core::queue::WorkQueue;
use tether_core::session::{SessionId, SessionResolver};
use tracing::{debug, info, warn};

use crate::callback::CallerCallback;
use crate::record::{Classification, LocalCallRecord};

/// One call against a target.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// The component to call.
    pub descriptor: Descriptor,
    /// Session to call it under; `None` or an unspecified id resolves to
    /// the current session.
    pub session: Option<SessionId>,
    /// Whether the call must also bring the target to the foreground,
    /// even when a cached handle resolves it immediately.
    pub to_foreground: bool,
    /// Caller behind the request, forwarded to the start service.
    pub caller: CallerToken,
}

impl CallRequest {
    /// Background call in the current session.
    pub fn new(descriptor: Descriptor, caller: CallerToken) -> Self {
        Self {
            descriptor,
            session: None,
            to_foreground: false,
            caller,
        }
    }

    /// Pins the call to a session.
    #[must_use]
    pub const fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Demands the target be brought to the foreground.
    #[must_use]
    pub const fn to_foreground(mut self) -> Self {
        self.to_foreground = true;
        self
    }
}

/// External service that brings targets up and releases connections.
pub trait ComponentStartService: Send + Sync {
    /// Asks the framework to start `request.descriptor` and report back
    /// through `observer`.
    fn start_by_intent(
        &self,
        request: &CallRequest,
        observer: Arc<dyn ConnectionObserver>,
        session: SessionId,
    ) -> Result<(), CallError>;

    /// Releases the connection previously registered under `observer`.
    fn release_connection(
        &self,
        observer: Arc<dyn ConnectionObserver>,
        descriptor: &Descriptor,
    ) -> Result<(), CallError>;
}

/// Sink for caller-visible disconnect notifications.
///
/// A disconnect notification is informational; the container does not tear
/// records down for it.
pub trait RemoteStateListener: Send + Sync {
    /// The target reported a disconnect with `code`.
    fn on_remote_disconnected(&self, descriptor: &Descriptor, code: i32);
}

/// Adapter registered with the start service for one connect attempt.
///
/// Holds the record strongly and the container weakly; when the container
/// is gone by the time a notification arrives, the notification is
/// dropped.
pub struct CallerConnection {
    id: u64,
    record: Arc<LocalCallRecord>,
    container: Weak<LocalCallContainer>,
}

impl CallerConnection {
    fn new(record: Arc<LocalCallRecord>, container: Weak<LocalCallContainer>) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let connection = Arc::new(Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            record,
            container,
        });
        connection.record.set_connection(&connection);
        connection
    }

    /// Stable id within the in-flight adapter set.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The record this adapter feeds.
    #[must_use]
    pub fn record(&self) -> Arc<LocalCallRecord> {
        Arc::clone(&self.record)
    }
}

impl ConnectionObserver for CallerConnection {
    fn on_connect_done(&self, descriptor: &Descriptor, handle: RemoteHandle, class_code: i32) {
        let Some(container) = self.container.upgrade() else {
            warn!(adapter = self.id, "container gone, dropping connect notification");
            return;
        };
        container.on_remote_connected(self, descriptor, handle, class_code);
    }

    fn on_disconnect_done(&self, descriptor: &Descriptor, code: i32) {
        let Some(container) = self.container.upgrade() else {
            return;
        };
        container.on_remote_disconnected(descriptor, code);
    }
}

impl std::fmt::Debug for CallerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerConnection")
            .field("id", &self.id)
            .field("record", &self.record.id())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ContainerInner {
    /// key -> the one shared record under that key.
    singleton: HashMap<String, Arc<LocalCallRecord>>,
    /// key -> one record per owning session.
    per_session: HashMap<String, Vec<Arc<LocalCallRecord>>>,
    /// In-flight and live connection adapters by id.
    connections: HashMap<u64, Arc<CallerConnection>>,
    /// Cached answer from the session resolver.
    current_session: Option<SessionId>,
}

/// Client-side owner of call records and connection adapters.
pub struct LocalCallContainer {
    inner: Mutex<ContainerInner>,
    start_service: Arc<dyn ComponentStartService>,
    sessions: Arc<dyn SessionResolver>,
    listener: Mutex<Option<Arc<dyn RemoteStateListener>>>,
    queue: WorkQueue,
}

impl LocalCallContainer {
    /// Creates a container. Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        start_service: Arc<dyn ComponentStartService>,
        sessions: Arc<dyn SessionResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ContainerInner::default()),
            start_service,
            sessions,
            listener: Mutex::new(None),
            queue: WorkQueue::new("local-call-container"),
        })
    }

    /// Installs the disconnect-notification sink.
    pub fn set_state_listener(&self, listener: Arc<dyn RemoteStateListener>) {
        *self.listener.lock().expect("listener poisoned") = Some(listener);
    }

    /// Subscribes to a death source; events are posted onto the container
    /// queue and handled there, never inline on the notifying thread.
    pub fn bind_death_source(self: &Arc<Self>, source: &dyn DeathNotificationSource) {
        let weak = Arc::downgrade(self);
        source.subscribe(DeathRecipient::new(move |identity| {
            let Some(container) = weak.upgrade() else {
                return;
            };
            let inner = Arc::downgrade(&container);
            container.queue.post(move || {
                if let Some(container) = inner.upgrade() {
                    container.on_target_died(identity);
                }
            });
        }));
    }

    /// Obtains a callable handle to a target.
    ///
    /// A cached resolution fires `callback` synchronously; otherwise the
    /// caller queues on the record serving (descriptor, session): one
    /// in-flight start per record, however many callers pile on. A failed
    /// start unwinds the attempt completely before the error is returned.
    pub fn call(
        self: &Arc<Self>,
        request: CallRequest,
        callback: Arc<CallerCallback>,
    ) -> Result<(), CallError> {
        if !request.descriptor.is_valid() {
            warn!(uri = %request.descriptor.uri(), "rejecting call with empty target");
            return Err(CallError::InvalidTarget {
                uri: request.descriptor.uri(),
            });
        }
        let session = self.resolve_session(request.session);

        let mut cached = None;
        let adapter = {
            let mut inner = self.inner.lock().expect("container poisoned");
            match Self::find_record(&inner, &request.descriptor, session) {
                Some(record) => {
                    record.add_caller(&callback);
                    match record.remote() {
                        Some(remote) => {
                            cached = Some(remote);
                            if request.to_foreground {
                                // The cached handle answers the caller, but
                                // the foreground demand still goes out.
                                let adapter =
                                    CallerConnection::new(record, Arc::downgrade(self));
                                inner.connections.insert(adapter.id(), Arc::clone(&adapter));
                                Some(adapter)
                            } else {
                                None
                            }
                        },
                        // An attempt is already in flight; ride it.
                        None => None,
                    }
                },
                None => {
                    let record = LocalCallRecord::new(request.descriptor.clone(), session);
                    record.add_caller(&callback);
                    let adapter = CallerConnection::new(record, Arc::downgrade(self));
                    inner.connections.insert(adapter.id(), Arc::clone(&adapter));
                    debug!(
                        adapter = adapter.id(),
                        in_flight = inner.connections.len(),
                        "created call record and adapter"
                    );
                    Some(adapter)
                },
            }
        };

        if let Some(remote) = cached {
            callback.fire(Ok(remote));
            if !request.to_foreground {
                return Ok(());
            }
        }
        let Some(adapter) = adapter else {
            return Ok(());
        };

        let observer: Arc<dyn ConnectionObserver> = adapter.clone();
        match self
            .start_service
            .start_by_intent(&request, observer, session)
        {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, uri = %request.descriptor.uri(), "start failed, unwinding");
                self.clear_failed_call(adapter.id());
                Err(err)
            },
        }
    }

    /// Releases one caller's interest. The shared connection stays up
    /// while other callers remain; the last release removes the record
    /// from its index and releases the external connection.
    ///
    /// Local bookkeeping is removed before the external call: a failing
    /// release surfaces `ReleaseFailed`, with local state already clean.
    pub fn release(&self, callback: &Arc<CallerCallback>) -> Result<(), CallError> {
        let record = callback.record().upgrade().ok_or(CallError::NotFound)?;
        let (adapter, descriptor) = {
            let mut inner = self.inner.lock().expect("container poisoned");
            if !record.remove_caller(callback) {
                return Err(CallError::NotFound);
            }
            if record.has_callers() {
                debug!(record = record.id(), "other callers remain, keeping connection");
                return Ok(());
            }
            let adapter = record.connection().ok_or(CallError::NoConnection)?;
            let key = record.descriptor().uri();
            match record.classification() {
                Classification::Singleton => {
                    let held = inner
                        .singleton
                        .get(&key)
                        .is_some_and(|r| Arc::ptr_eq(r, &record));
                    if !held {
                        return Err(CallError::NotFound);
                    }
                    inner.singleton.remove(&key);
                },
                Classification::PerSession(_) => {
                    let Some(bucket) = inner.per_session.get_mut(&key) else {
                        return Err(CallError::NotFound);
                    };
                    let Some(pos) = bucket.iter().position(|r| Arc::ptr_eq(r, &record)) else {
                        return Err(CallError::NotFound);
                    };
                    bucket.remove(pos);
                    if bucket.is_empty() {
                        inner.per_session.remove(&key);
                    }
                },
                // Never classified: the record was only ever reachable
                // through the adapter set.
                Classification::Unclassified => {},
            }
            inner.connections.remove(&adapter.id());
            (adapter, record.descriptor().clone())
        };

        info!(record = record.id(), uri = %descriptor.uri(), "releasing call connection");
        let observer: Arc<dyn ConnectionObserver> = adapter;
        self.start_service
            .release_connection(observer, &descriptor)
            .map_err(|err| CallError::ReleaseFailed {
                message: err.to_string(),
            })
    }

    /// Invoked by an adapter when the target attached: stores the handle,
    /// commits the classification and index placement, and resolves every
    /// queued caller exactly once.
    pub fn on_remote_connected(
        &self,
        adapter: &CallerConnection,
        descriptor: &Descriptor,
        handle: RemoteHandle,
        class_code: i32,
    ) {
        let record = adapter.record();
        let class = LaunchClass::from_code(class_code);
        debug!(uri = %descriptor.uri(), ?class, record = record.id(), "remote connected");
        record.set_remote(handle);
        {
            let mut inner = self.inner.lock().expect("container poisoned");
            let key = record.descriptor().uri();
            match class {
                LaunchClass::Singleton => {
                    record.set_classification(Classification::Singleton);
                    let previous = inner.singleton.insert(key, Arc::clone(&record));
                    if previous.is_some_and(|p| !Arc::ptr_eq(&p, &record)) {
                        warn!(record = record.id(), "singleton slot replaced an older record");
                    }
                },
                LaunchClass::PerSession => {
                    record.set_classification(Classification::PerSession(record.session()));
                    let bucket = inner.per_session.entry(key).or_default();
                    if !bucket.iter().any(|r| Arc::ptr_eq(r, &record)) {
                        bucket.push(Arc::clone(&record));
                    }
                },
            }
        }
        record.fire_callers();
    }

    /// Invoked by an adapter on a disconnect notification. Informational:
    /// forwarded to the listener, no teardown.
    pub fn on_remote_disconnected(&self, descriptor: &Descriptor, code: i32) {
        debug!(uri = %descriptor.uri(), code, "remote disconnected");
        let listener = self.listener.lock().expect("listener poisoned").clone();
        if let Some(listener) = listener {
            listener.on_remote_disconnected(descriptor, code);
        }
    }

    /// The remote process behind `identity` died: fails the queued callers
    /// of the first matching record in each index and drops the record's
    /// index entry (and bucket, when it empties).
    pub fn on_target_died(&self, identity: HandleIdentity) {
        let mut dead = Vec::new();
        {
            let mut inner = self.inner.lock().expect("container poisoned");
            let singleton_key = inner
                .singleton
                .iter()
                .find(|(_, r)| r.is_same_object(identity))
                .map(|(k, _)| k.clone());
            if let Some(key) = singleton_key {
                info!(%key, "singleton call target died");
                if let Some(record) = inner.singleton.remove(&key) {
                    dead.push(record);
                }
            }

            let per_session_key = inner
                .per_session
                .iter()
                .find(|(_, bucket)| bucket.iter().any(|r| r.is_same_object(identity)))
                .map(|(k, _)| k.clone());
            if let Some(key) = per_session_key {
                info!(%key, "per-session call target died");
                if let Some(bucket) = inner.per_session.get_mut(&key) {
                    if let Some(pos) = bucket.iter().position(|r| r.is_same_object(identity)) {
                        dead.push(bucket.remove(pos));
                    }
                    if bucket.is_empty() {
                        inner.per_session.remove(&key);
                    }
                }
            }
        }
        for record in dead {
            record.notify_died();
        }
    }

    /// The target reported a foreground/background move; fans it out to
    /// the resolved callers of the matching record.
    pub fn on_remote_state_changed(&self, descriptor: &Descriptor, state: &str) {
        let session = self.resolve_session(None);
        let record = {
            let inner = self.inner.lock().expect("container poisoned");
            Self::find_record(&inner, descriptor, session)
        };
        if let Some(record) = record {
            record.notify_state_changed(state);
        }
    }

    /// One diagnostic line per record in the singleton index.
    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("container poisoned");
        inner
            .singleton
            .iter()
            .map(|(key, record)| {
                let state = if record.all_fired() {
                    "REQUESTEND"
                } else {
                    "REQUESTING"
                };
                format!(
                    "  LocalCallRecord ID #{} callee uri[{}] callers #{} state #{}",
                    record.id(),
                    key,
                    record.caller_count(),
                    state
                )
            })
            .collect()
    }

    /// Number of in-flight and live adapters, for diagnostics.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().expect("container poisoned").connections.len()
    }

    /// Drops the adapter of an attempt the start service rejected. The
    /// partial record unwinds with it; the caller is left unregistered.
    fn clear_failed_call(&self, adapter_id: u64) {
        let mut inner = self.inner.lock().expect("container poisoned");
        if inner.connections.remove(&adapter_id).is_some() {
            debug!(adapter = adapter_id, "cleared failed call attempt");
        }
    }

    fn resolve_session(&self, requested: Option<SessionId>) -> SessionId {
        if let Some(session) = requested {
            if session.is_specified() {
                return session;
            }
        }
        let mut inner = self.inner.lock().expect("container poisoned");
        if let Some(session) = inner.current_session {
            return session;
        }
        let session = self.sessions.current_session_id();
        inner.current_session = Some(session);
        debug!(%session, "resolved and cached current session");
        session
    }

    /// Search order: singleton index (module-normalized key match plus
    /// session), then the per-session index, then records still in flight.
    fn find_record(
        inner: &ContainerInner,
        descriptor: &Descriptor,
        session: SessionId,
    ) -> Option<Arc<LocalCallRecord>> {
        for record in inner.singleton.values() {
            if record.descriptor().matches_query(descriptor) && record.session() == session {
                return Some(Arc::clone(record));
            }
        }
        let key = descriptor.uri();
        if let Some(record) = inner.per_session.get(&key).and_then(|bucket| {
            bucket.iter().find(|r| r.session() == session).cloned()
        }) {
            return Some(record);
        }
        inner
            .connections
            .values()
            .map(|adapter| adapter.record())
            .find(|record| {
                record.classification() == Classification::Unclassified
                    && record.descriptor().uri() == key
                    && record.session() == session
            })
    }
}

impl std::fmt::Debug for LocalCallContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("container poisoned");
        f.debug_struct("LocalCallContainer")
            .field("singleton", &inner.singleton.len())
            .field("per_session", &inner.per_session.len())
            .field("connections", &inner.connections.len())
            .finish_non_exhaustive()
    }
}
