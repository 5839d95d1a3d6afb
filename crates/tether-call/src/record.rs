//! Local call records.
//!
//! One record per (descriptor, session) pair the container has seen: the
//! target's remote handle once resolved, the ordered caller list, the
//! classification tag that decides index placement, and a weak
//! back-reference to the connection adapter. Records are shared between
//! the container and its adapters; the last releaser frees them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tether_core::descriptor::Descriptor;
use tether_core::error::CallError;
use tether_core::handle::{HandleIdentity, RemoteHandle};
use tether_core::session::SessionId;
use tracing::{debug, warn};

use crate::callback::CallerCallback;
use crate::container::CallerConnection;

/// How the record is indexed, decided when the target first connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not yet connected; the record lives in no index.
    Unclassified,
    /// One shared record per key.
    Singleton,
    /// One record per (key, session).
    PerSession(SessionId),
}

struct RecordInner {
    remote: Option<RemoteHandle>,
    classification: Classification,
    callers: Vec<Arc<CallerCallback>>,
    connection: Weak<CallerConnection>,
}

/// Client-side aggregate of all callers for one (target, session) pair.
pub struct LocalCallRecord {
    id: u64,
    descriptor: Descriptor,
    session: SessionId,
    inner: Mutex<RecordInner>,
}

impl LocalCallRecord {
    /// Creates an unclassified record with no callers.
    pub fn new(descriptor: Descriptor, session: SessionId) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            descriptor,
            session,
            inner: Mutex::new(RecordInner {
                remote: None,
                classification: Classification::Unclassified,
                callers: Vec::new(),
                connection: Weak::new(),
            }),
        })
    }

    /// Stable id, for diagnostics.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Descriptor the record serves.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Session that created the record.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Adopts a caller and binds its back-reference.
    pub fn add_caller(self: &Arc<Self>, caller: &Arc<CallerCallback>) {
        caller.bind_record(self);
        self.inner
            .lock()
            .expect("record poisoned")
            .callers
            .push(Arc::clone(caller));
    }

    /// Removes a caller. Returns `false` when it was not queued here.
    pub fn remove_caller(&self, caller: &Arc<CallerCallback>) -> bool {
        let mut inner = self.inner.lock().expect("record poisoned");
        let before = inner.callers.len();
        inner.callers.retain(|c| !Arc::ptr_eq(c, caller));
        inner.callers.len() != before
    }

    /// Whether any caller remains queued.
    #[must_use]
    pub fn has_callers(&self) -> bool {
        !self.inner.lock().expect("record poisoned").callers.is_empty()
    }

    /// Number of queued callers.
    #[must_use]
    pub fn caller_count(&self) -> usize {
        self.inner.lock().expect("record poisoned").callers.len()
    }

    /// Whether every queued caller has fired.
    #[must_use]
    pub fn all_fired(&self) -> bool {
        self.inner
            .lock()
            .expect("record poisoned")
            .callers
            .iter()
            .all(|c| c.has_fired())
    }

    /// The resolved remote handle, if connected.
    #[must_use]
    pub fn remote(&self) -> Option<RemoteHandle> {
        self.inner.lock().expect("record poisoned").remote.clone()
    }

    /// Stores the resolved remote handle.
    pub fn set_remote(&self, remote: RemoteHandle) {
        self.inner.lock().expect("record poisoned").remote = Some(remote);
    }

    /// Whether this record proxies the remote object behind `identity`.
    #[must_use]
    pub fn is_same_object(&self, identity: HandleIdentity) -> bool {
        self.inner
            .lock()
            .expect("record poisoned")
            .remote
            .as_ref()
            .is_some_and(|r| r.identity() == identity)
    }

    /// Classification tag.
    #[must_use]
    pub fn classification(&self) -> Classification {
        self.inner.lock().expect("record poisoned").classification
    }

    /// Commits the classification once the target reports it.
    pub fn set_classification(&self, classification: Classification) {
        self.inner.lock().expect("record poisoned").classification = classification;
    }

    /// The connection adapter, if still alive.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<CallerConnection>> {
        self.inner
            .lock()
            .expect("record poisoned")
            .connection
            .upgrade()
    }

    /// Binds the connection adapter.
    pub fn set_connection(&self, connection: &Arc<CallerConnection>) {
        self.inner.lock().expect("record poisoned").connection = Arc::downgrade(connection);
    }

    /// Fires every unfired caller with the resolved handle.
    pub fn fire_callers(&self) {
        let (remote, callers) = {
            let inner = self.inner.lock().expect("record poisoned");
            (inner.remote.clone(), inner.callers.clone())
        };
        let Some(remote) = remote else {
            warn!(record = self.id, "no remote handle, cannot fire callers");
            return;
        };
        for caller in callers {
            if !caller.has_fired() {
                caller.fire(Ok(remote.clone()));
            }
        }
        debug!(record = self.id, "callers resolved");
    }

    /// Fails every unfired caller: the remote process died.
    pub fn notify_died(&self) {
        let callers = {
            let mut inner = self.inner.lock().expect("record poisoned");
            inner.remote = None;
            inner.callers.clone()
        };
        for caller in callers {
            caller.fire(Err(CallError::TargetDied));
        }
    }

    /// Fans a remote-state change out to the callers that have resolved.
    pub fn notify_state_changed(&self, state: &str) {
        let callers = self.inner.lock().expect("record poisoned").callers.clone();
        for caller in callers {
            if caller.has_fired() {
                caller.notify_state(state);
            }
        }
    }
}

impl std::fmt::Debug for LocalCallRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCallRecord")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor.uri())
            .field("session", &self.session)
            .field("callers", &self.caller_count())
            .finish_non_exhaustive()
    }
}
