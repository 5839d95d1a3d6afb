//! End-to-end tests for the local call container, driven through a
//! recording start service standing in for the framework side.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_call::callback::CallerCallback;
use tether_call::container::{CallRequest, ComponentStartService, LocalCallContainer};
use tether_core::death::DeathFeed;
use tether_core::descriptor::Descriptor;
use tether_core::error::CallError;
use tether_core::handle::{CallerToken, HandleIdentity, RemoteHandle};
use tether_core::observer::{ConnectionObserver, LaunchClass};
use tether_core::session::{FixedSessionResolver, SessionId, SessionResolver};

#[derive(Default)]
struct RecordingStartService {
    starts: Mutex<Vec<(String, i32)>>,
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
    releases: Mutex<Vec<String>>,
    fail_start: AtomicBool,
    fail_release: AtomicBool,
}

impl RecordingStartService {
    fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    fn release_count(&self) -> usize {
        self.releases.lock().unwrap().len()
    }

    fn observer(&self, index: usize) -> Arc<dyn ConnectionObserver> {
        Arc::clone(&self.observers.lock().unwrap()[index])
    }
}

impl ComponentStartService for RecordingStartService {
    fn start_by_intent(
        &self,
        request: &CallRequest,
        observer: Arc<dyn ConnectionObserver>,
        session: SessionId,
    ) -> Result<(), CallError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CallError::StartFailed {
                message: "refused".into(),
            });
        }
        self.starts
            .lock()
            .unwrap()
            .push((request.descriptor.uri(), session.0));
        self.observers.lock().unwrap().push(observer);
        Ok(())
    }

    fn release_connection(
        &self,
        _observer: Arc<dyn ConnectionObserver>,
        descriptor: &Descriptor,
    ) -> Result<(), CallError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(CallError::StartFailed {
                message: "io".into(),
            });
        }
        self.releases.lock().unwrap().push(descriptor.uri());
        Ok(())
    }
}

type FiredResults = Arc<Mutex<Vec<Result<HandleIdentity, CallError>>>>;

fn recording_callback() -> (Arc<CallerCallback>, FiredResults) {
    let results: FiredResults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    let callback = CallerCallback::new(move |result| {
        sink.lock().unwrap().push(result.map(|h| h.identity()));
    });
    (callback, results)
}

fn descriptor() -> Descriptor {
    Descriptor::local("com.example.app", "DataService")
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}

fn container(service: &Arc<RecordingStartService>) -> Arc<LocalCallContainer> {
    init_tracing();
    let dyn_service: Arc<dyn ComponentStartService> = service.clone();
    LocalCallContainer::new(dyn_service, Arc::new(FixedSessionResolver(SessionId(7))))
}

fn request() -> CallRequest {
    CallRequest::new(descriptor(), CallerToken::next())
}

/// Answers the most recent start attempt as connected.
fn connect(service: &RecordingStartService, handle: &RemoteHandle, class: LaunchClass) {
    let index = service.observers.lock().unwrap().len() - 1;
    service
        .observer(index)
        .on_connect_done(&descriptor(), handle.clone(), class.code());
}

#[tokio::test]
async fn call_resolves_through_start_service() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb, results) = recording_callback();

    container.call(request(), cb).unwrap();
    assert_eq!(service.start_count(), 1);
    assert!(results.lock().unwrap().is_empty());

    let handle = RemoteHandle::new("svc");
    connect(&service, &handle, LaunchClass::Singleton);

    assert_eq!(*results.lock().unwrap(), vec![Ok(handle.identity())]);
    // Resolved and singleton-classified: one dump line, request ended.
    let dump = container.dump();
    assert_eq!(dump.len(), 1);
    assert!(dump[0].contains("REQUESTEND"));
}

#[tokio::test]
async fn empty_component_name_is_rejected_without_side_effects() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb, results) = recording_callback();

    let err = container
        .call(
            CallRequest::new(Descriptor::local("com.example.app", ""), CallerToken::next()),
            cb,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_target");
    assert_eq!(service.start_count(), 0);
    assert_eq!(container.connection_count(), 0);
    assert!(results.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callers_multiplex_onto_one_start() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb1, results1) = recording_callback();
    let (cb2, results2) = recording_callback();

    container.call(request(), Arc::clone(&cb1)).unwrap();
    container.call(request(), Arc::clone(&cb2)).unwrap();

    // Two callers, one record, one external start.
    assert_eq!(service.start_count(), 1);
    let record1 = cb1.record().upgrade().unwrap();
    let record2 = cb2.record().upgrade().unwrap();
    assert!(Arc::ptr_eq(&record1, &record2));
    assert_eq!(record1.caller_count(), 2);

    let handle = RemoteHandle::new("svc");
    connect(&service, &handle, LaunchClass::Singleton);
    assert_eq!(*results1.lock().unwrap(), vec![Ok(handle.identity())]);
    assert_eq!(*results2.lock().unwrap(), vec![Ok(handle.identity())]);
}

#[tokio::test]
async fn resolved_record_answers_from_cache() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb1, _results1) = recording_callback();

    container.call(request(), cb1).unwrap();
    let handle = RemoteHandle::new("svc");
    connect(&service, &handle, LaunchClass::Singleton);

    let (cb2, results2) = recording_callback();
    container.call(request(), cb2).unwrap();

    // Synchronous resolution, no second start.
    assert_eq!(*results2.lock().unwrap(), vec![Ok(handle.identity())]);
    assert_eq!(service.start_count(), 1);
}

#[tokio::test]
async fn foreground_demand_still_reaches_the_framework_on_cache_hit() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb1, _results1) = recording_callback();

    container.call(request(), cb1).unwrap();
    connect(&service, &RemoteHandle::new("svc"), LaunchClass::Singleton);

    let (cb2, results2) = recording_callback();
    container.call(request().to_foreground(), cb2).unwrap();

    // The cached handle fired the caller and the start went out anyway.
    assert_eq!(results2.lock().unwrap().len(), 1);
    assert_eq!(service.start_count(), 2);
}

#[tokio::test]
async fn failed_start_unwinds_completely() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb, results) = recording_callback();

    service.fail_start.store(true, Ordering::SeqCst);
    let err = container.call(request(), Arc::clone(&cb)).unwrap_err();
    assert_eq!(err.kind(), "start_failed");

    // Adapter set and indices are exactly as before the call.
    assert_eq!(container.connection_count(), 0);
    assert!(container.dump().is_empty());
    assert!(results.lock().unwrap().is_empty());
    assert!(cb.record().upgrade().is_none());

    // A later attempt starts from scratch.
    service.fail_start.store(false, Ordering::SeqCst);
    let (cb2, _results2) = recording_callback();
    container.call(request(), cb2).unwrap();
    assert_eq!(service.start_count(), 1);
}

#[tokio::test]
async fn last_release_removes_record_and_releases_connection() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb, _results) = recording_callback();

    container.call(request(), Arc::clone(&cb)).unwrap();
    connect(&service, &RemoteHandle::new("svc"), LaunchClass::Singleton);

    container.release(&cb).unwrap();
    assert_eq!(service.release_count(), 1);
    assert!(container.dump().is_empty());
    assert_eq!(container.connection_count(), 0);
}

#[tokio::test]
async fn release_keeps_shared_connection_for_remaining_callers() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb1, _r1) = recording_callback();
    let (cb2, _r2) = recording_callback();

    container.call(request(), Arc::clone(&cb1)).unwrap();
    container.call(request(), Arc::clone(&cb2)).unwrap();
    connect(&service, &RemoteHandle::new("svc"), LaunchClass::Singleton);

    container.release(&cb1).unwrap();
    assert_eq!(service.release_count(), 0);
    assert_eq!(container.dump().len(), 1);

    container.release(&cb2).unwrap();
    assert_eq!(service.release_count(), 1);
    assert!(container.dump().is_empty());
}

#[tokio::test]
async fn release_of_unknown_callback_is_rejected() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb, _results) = recording_callback();
    assert_eq!(container.release(&cb).unwrap_err(), CallError::NotFound);
}

#[tokio::test]
async fn failed_external_release_leaves_local_state_clean() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb, _results) = recording_callback();

    container.call(request(), Arc::clone(&cb)).unwrap();
    connect(&service, &RemoteHandle::new("svc"), LaunchClass::Singleton);

    service.fail_release.store(true, Ordering::SeqCst);
    let err = container.release(&cb).unwrap_err();
    assert_eq!(err.kind(), "release_failed");
    assert!(err.is_local_state_clean());

    // Local bookkeeping went away regardless of the external failure.
    assert!(container.dump().is_empty());
    assert_eq!(container.connection_count(), 0);
}

#[tokio::test]
async fn target_death_fails_queued_callers_and_drops_bucket() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let (cb1, results1) = recording_callback();

    container.call(request(), Arc::clone(&cb1)).unwrap();
    let handle = RemoteHandle::new("svc");
    connect(&service, &handle, LaunchClass::Singleton);
    assert_eq!(results1.lock().unwrap().len(), 1);

    // Two more interests queue up behind the resolved record without
    // firing.
    let record = cb1.record().upgrade().unwrap();
    let (cb2, results2) = recording_callback();
    let (cb3, results3) = recording_callback();
    record.add_caller(&cb2);
    record.add_caller(&cb3);

    container.on_target_died(handle.identity());

    assert_eq!(*results2.lock().unwrap(), vec![Err(CallError::TargetDied)]);
    assert_eq!(*results3.lock().unwrap(), vec![Err(CallError::TargetDied)]);
    // The resolved caller is not re-fired.
    assert_eq!(results1.lock().unwrap().len(), 1);
    assert!(container.dump().is_empty());

    // The next call starts over.
    let (cb4, _r4) = recording_callback();
    container.call(request(), cb4).unwrap();
    assert_eq!(service.start_count(), 2);
}

#[tokio::test]
async fn death_events_flow_through_the_queue() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);
    let feed = DeathFeed::new();
    container.bind_death_source(&feed);

    let (cb, _results) = recording_callback();
    container.call(request(), cb).unwrap();
    let handle = RemoteHandle::new("svc");
    connect(&service, &handle, LaunchClass::Singleton);

    feed.report(handle.identity());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(container.dump().is_empty());
}

#[tokio::test]
async fn singleton_index_holds_at_most_one_record_per_key() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);

    let (cb1, _r1) = recording_callback();
    container
        .call(request().with_session(SessionId(1)), cb1)
        .unwrap();
    connect(&service, &RemoteHandle::new("svc-a"), LaunchClass::Singleton);

    // A second session resolves the same key; the singleton slot is
    // replaced, never doubled.
    let (cb2, _r2) = recording_callback();
    container
        .call(request().with_session(SessionId(2)), cb2)
        .unwrap();
    connect(&service, &RemoteHandle::new("svc-b"), LaunchClass::Singleton);

    assert_eq!(container.dump().len(), 1);
}

#[tokio::test]
async fn per_session_targets_get_one_record_per_session() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);

    let (cb1, results1) = recording_callback();
    container
        .call(request().with_session(SessionId(1)), Arc::clone(&cb1))
        .unwrap();
    let handle_a = RemoteHandle::new("svc-a");
    connect(&service, &handle_a, LaunchClass::PerSession);

    let (cb2, results2) = recording_callback();
    container
        .call(request().with_session(SessionId(2)), Arc::clone(&cb2))
        .unwrap();
    let handle_b = RemoteHandle::new("svc-b");
    connect(&service, &handle_b, LaunchClass::PerSession);

    assert_eq!(service.start_count(), 2);
    assert_eq!(*results1.lock().unwrap(), vec![Ok(handle_a.identity())]);
    assert_eq!(*results2.lock().unwrap(), vec![Ok(handle_b.identity())]);

    // Each session rides its own record.
    let r1 = cb1.record().upgrade().unwrap();
    let r2 = cb2.record().upgrade().unwrap();
    assert!(!Arc::ptr_eq(&r1, &r2));

    // Releasing one session leaves the other connected.
    container.release(&cb1).unwrap();
    assert_eq!(service.release_count(), 1);
    let (cb3, results3) = recording_callback();
    container
        .call(request().with_session(SessionId(2)), cb3)
        .unwrap();
    assert_eq!(*results3.lock().unwrap(), vec![Ok(handle_b.identity())]);
    assert_eq!(service.start_count(), 2);
}

#[tokio::test]
async fn singleton_lookup_ignores_module_segment() {
    let service = Arc::new(RecordingStartService::default());
    let container = container(&service);

    let with_module = Descriptor::new("", "com.example.app", "entry", "DataService");
    let (cb1, _r1) = recording_callback();
    container
        .call(
            CallRequest::new(with_module.clone(), CallerToken::next()),
            cb1,
        )
        .unwrap();
    let handle = RemoteHandle::new("svc");
    let index = service.observers.lock().unwrap().len() - 1;
    service
        .observer(index)
        .on_connect_done(&with_module, handle.clone(), LaunchClass::Singleton.code());

    // The same component without a module segment hits the cache.
    let (cb2, results2) = recording_callback();
    container.call(request(), cb2).unwrap();
    assert_eq!(*results2.lock().unwrap(), vec![Ok(handle.identity())]);
    assert_eq!(service.start_count(), 1);
}

#[tokio::test]
async fn current_session_is_resolved_once() {
    struct CountingResolver {
        hits: AtomicUsize,
    }

    impl SessionResolver for CountingResolver {
        fn current_session_id(&self) -> SessionId {
            self.hits.fetch_add(1, Ordering::SeqCst);
            SessionId(3)
        }
    }

    let service = Arc::new(RecordingStartService::default());
    let dyn_service: Arc<dyn ComponentStartService> = service.clone();
    let resolver = Arc::new(CountingResolver {
        hits: AtomicUsize::new(0),
    });
    let container = LocalCallContainer::new(dyn_service, resolver.clone());

    let (cb1, _r1) = recording_callback();
    let (cb2, _r2) = recording_callback();
    container.call(request(), cb1).unwrap();
    container.call(request(), cb2).unwrap();

    assert_eq!(resolver.hits.load(Ordering::SeqCst), 1);
    assert_eq!(service.starts.lock().unwrap()[0].1, 3);
}
