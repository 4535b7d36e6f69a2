//! Test doubles for the tracker runtime and the managed collector
//!
//! Mock objects are boxed so their addresses stay stable while raw pointers to
//! them are handed across the binary interface. Reference counts are tracked
//! for assertions but never free anything; the owning `Box` does.

use crate::abi::{
    write_interface, ComPtr, Guid, HResult, IFindReferenceTargetsCallback, IReferenceTracker,
    IReferenceTrackerHost, IReferenceTrackerManager, IReferenceTrackerManagerVtbl,
    IReferenceTrackerTarget, IReferenceTrackerTargetVtbl, IReferenceTrackerVtbl, IUnknown,
    IUnknownVtbl, Interface,
};
use crate::error::{TrackerError, TrackerResult};
use crate::runtime::{
    CollectionPass, CreateComInterfaceFlags, CreateObjectFlags, ExternalObjectContext, GcRequest,
    ObjectHandle, RuntimeImports,
};
use core::ffi::c_void;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Calls observed on the tracker runtime side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    HostRegistered,
    TrackingStarted,
    FindTargetsCompleted { walk_failed: bool },
    TrackingCompleted,
    Connect(u32),
    AddRefFromSource(u32),
    ReleaseFromSource(u32),
    PegFromSource(u32),
    Disconnect(u32),
    FindTargets(u32),
}

/// Ordered event log shared by the mocks of one test
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: Event) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Reference count bookkeeping shared by all mocks
#[derive(Debug, Default)]
struct Refs {
    count: AtomicU32,
    releases: AtomicUsize,
}

impl Refs {
    fn add(&self) -> u32 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> u32 {
        self.releases.fetch_add(1, Ordering::SeqCst);
        let old = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "mock released more often than referenced");
        old - 1
    }
}

unsafe fn answer_query(
    this: *mut c_void,
    refs: &Refs,
    iid: *const Guid,
    out: *mut *mut c_void,
    supported: &[Guid],
) -> HResult {
    let resolved = iid
        .as_ref()
        .filter(|iid| **iid == IUnknown::IID || supported.contains(*iid))
        .map(|_| {
            refs.add();
            this
        });
    write_interface(out, resolved)
}

// ============================================================================
// Coordinator
// ============================================================================

static MANAGER_VTBL: IReferenceTrackerManagerVtbl = IReferenceTrackerManagerVtbl {
    base: IUnknownVtbl {
        query_interface: manager_query_interface,
        add_ref: manager_add_ref,
        release: manager_release,
    },
    reference_tracking_started: manager_reference_tracking_started,
    find_tracker_targets_completed: manager_find_tracker_targets_completed,
    reference_tracking_completed: manager_reference_tracking_completed,
    set_reference_tracker_host: manager_set_reference_tracker_host,
};

/// Tracker runtime coordinator double
#[repr(C)]
pub struct MockTrackerManager {
    vtbl: *const IReferenceTrackerManagerVtbl,
    refs: Refs,
    host: AtomicPtr<IReferenceTrackerHost>,
    host_registrations: AtomicUsize,
    started_status: HResult,
    find_completed_status: HResult,
    completed_status: HResult,
    pegging_probe: Option<Arc<AtomicBool>>,
    pegged_at_completion: Mutex<Option<bool>>,
    events: Arc<EventLog>,
}

// Safety: mutable state is atomic or behind a mutex
unsafe impl Send for MockTrackerManager {}
unsafe impl Sync for MockTrackerManager {}

impl MockTrackerManager {
    pub fn new(events: Arc<EventLog>) -> Box<Self> {
        Box::new(Self {
            vtbl: &MANAGER_VTBL,
            refs: Refs::default(),
            host: AtomicPtr::new(core::ptr::null_mut()),
            host_registrations: AtomicUsize::new(0),
            started_status: HResult::S_OK,
            find_completed_status: HResult::S_OK,
            completed_status: HResult::S_OK,
            pegging_probe: None,
            pegged_at_completion: Mutex::new(None),
            events,
        })
    }

    /// `ReferenceTrackingStarted` fails with `status`
    pub fn failing_start(mut self: Box<Self>, status: HResult) -> Box<Self> {
        self.started_status = status;
        self
    }

    /// `FindTrackerTargetsCompleted` fails with `status`
    pub fn failing_find_completion(mut self: Box<Self>, status: HResult) -> Box<Self> {
        self.find_completed_status = status;
        self
    }

    /// `ReferenceTrackingCompleted` fails with `status`
    pub fn failing_completion(mut self: Box<Self>, status: HResult) -> Box<Self> {
        self.completed_status = status;
        self
    }

    /// Sample `flag` when `FindTrackerTargetsCompleted` arrives
    pub fn with_pegging_probe(mut self: Box<Self>, flag: Arc<AtomicBool>) -> Box<Self> {
        self.pegging_probe = Some(flag);
        self
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.count.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.refs.releases.load(Ordering::SeqCst)
    }

    pub fn host_registrations(&self) -> usize {
        self.host_registrations.load(Ordering::SeqCst)
    }

    pub fn registered_host(&self) -> Option<&IReferenceTrackerHost> {
        unsafe { self.host.load(Ordering::SeqCst).as_ref() }
    }

    pub fn pegged_at_completion(&self) -> Option<bool> {
        *self.pegged_at_completion.lock()
    }

    pub fn as_ptr(&self) -> *mut IReferenceTrackerManager {
        self as *const Self as *mut IReferenceTrackerManager
    }

    pub fn as_interface(&self) -> &IReferenceTrackerManager {
        unsafe { &*self.as_ptr() }
    }
}

unsafe fn manager<'a>(this: *mut c_void) -> &'a MockTrackerManager {
    &*(this as *const MockTrackerManager)
}

unsafe extern "system" fn manager_query_interface(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> HResult {
    answer_query(this, &manager(this).refs, iid, out, &[IReferenceTrackerManager::IID])
}

unsafe extern "system" fn manager_add_ref(this: *mut c_void) -> u32 {
    manager(this).refs.add()
}

unsafe extern "system" fn manager_release(this: *mut c_void) -> u32 {
    manager(this).refs.release()
}

unsafe extern "system" fn manager_reference_tracking_started(this: *mut c_void) -> HResult {
    let manager = manager(this);
    manager.events.push(Event::TrackingStarted);
    manager.started_status
}

unsafe extern "system" fn manager_find_tracker_targets_completed(this: *mut c_void, find_failed: u8) -> HResult {
    let manager = manager(this);
    if let Some(probe) = &manager.pegging_probe {
        *manager.pegged_at_completion.lock() = Some(probe.load(Ordering::SeqCst));
    }
    manager.events.push(Event::FindTargetsCompleted {
        walk_failed: find_failed != 0,
    });
    manager.find_completed_status
}

unsafe extern "system" fn manager_reference_tracking_completed(this: *mut c_void) -> HResult {
    let manager = manager(this);
    manager.events.push(Event::TrackingCompleted);
    manager.completed_status
}

unsafe extern "system" fn manager_set_reference_tracker_host(
    this: *mut c_void,
    host: *mut IReferenceTrackerHost,
) -> HResult {
    let manager = manager(this);
    manager.host.store(host, Ordering::SeqCst);
    manager.host_registrations.fetch_add(1, Ordering::SeqCst);
    manager.events.push(Event::HostRegistered);
    HResult::S_OK
}

// ============================================================================
// Tracker object
// ============================================================================

static TRACKER_VTBL: IReferenceTrackerVtbl = IReferenceTrackerVtbl {
    base: IUnknownVtbl {
        query_interface: tracker_query_interface,
        add_ref: tracker_add_ref,
        release: tracker_release,
    },
    connect_from_tracker_source: tracker_connect_from_tracker_source,
    disconnect_from_tracker_source: tracker_disconnect_from_tracker_source,
    find_tracker_targets: tracker_find_tracker_targets,
    get_reference_tracker_manager: tracker_get_reference_tracker_manager,
    add_ref_from_tracker_source: tracker_add_ref_from_tracker_source,
    release_from_tracker_source: tracker_release_from_tracker_source,
    peg_from_tracker_source: tracker_peg_from_tracker_source,
};

/// External object exposing `IReferenceTracker`
#[repr(C)]
pub struct MockTracker {
    vtbl: *const IReferenceTrackerVtbl,
    id: u32,
    refs: Refs,
    manager: *const MockTrackerManager,
    targets: Vec<*mut IReferenceTrackerTarget>,
    find_status: HResult,
    connect_status: HResult,
    swallow_callback_failures: bool,
    events: Arc<EventLog>,
}

// Safety: configuration is immutable after construction; counters are atomic
unsafe impl Send for MockTracker {}
unsafe impl Sync for MockTracker {}

impl MockTracker {
    pub fn new(id: u32, events: Arc<EventLog>) -> Box<Self> {
        Box::new(Self {
            vtbl: &TRACKER_VTBL,
            id,
            refs: Refs::default(),
            manager: core::ptr::null(),
            targets: Vec::new(),
            find_status: HResult::S_OK,
            connect_status: HResult::S_OK,
            swallow_callback_failures: false,
            events,
        })
    }

    /// Coordinator returned by `GetReferenceTrackerManager`; must outlive the tracker
    pub fn with_manager(mut self: Box<Self>, manager: &MockTrackerManager) -> Box<Self> {
        self.manager = manager;
        self
    }

    /// Targets reported, in order, from `FindTrackerTargets`; must outlive the tracker
    pub fn with_targets(mut self: Box<Self>, targets: &[&MockTarget]) -> Box<Self> {
        self.targets.extend(targets.iter().map(|target| target.as_ptr()));
        self
    }

    /// Report a null target from `FindTrackerTargets`
    pub fn with_null_target(mut self: Box<Self>) -> Box<Self> {
        self.targets.push(core::ptr::null_mut());
        self
    }

    /// `FindTrackerTargets` fails with `status` before reporting anything
    pub fn failing_find(mut self: Box<Self>, status: HResult) -> Box<Self> {
        self.find_status = status;
        self
    }

    /// Keep reporting targets and return success whatever the callback answers
    pub fn ignoring_callback_failures(mut self: Box<Self>) -> Box<Self> {
        self.swallow_callback_failures = true;
        self
    }

    /// `ConnectFromTrackerSource` fails with `status`
    pub fn failing_connect(mut self: Box<Self>, status: HResult) -> Box<Self> {
        self.connect_status = status;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.count.load(Ordering::SeqCst)
    }

    pub fn as_ptr(&self) -> *mut IReferenceTracker {
        self as *const Self as *mut IReferenceTracker
    }

    pub fn as_interface(&self) -> &IReferenceTracker {
        unsafe { &*self.as_ptr() }
    }

    /// Wrapper context for this tracker; the tracker must outlive the pass
    pub fn context(&self, runtime_context: ObjectHandle) -> ExternalObjectContext {
        unsafe { ExternalObjectContext::new(runtime_context, self.as_ptr()) }
    }
}

unsafe fn tracker<'a>(this: *mut c_void) -> &'a MockTracker {
    &*(this as *const MockTracker)
}

unsafe extern "system" fn tracker_query_interface(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> HResult {
    answer_query(this, &tracker(this).refs, iid, out, &[IReferenceTracker::IID])
}

unsafe extern "system" fn tracker_add_ref(this: *mut c_void) -> u32 {
    tracker(this).refs.add()
}

unsafe extern "system" fn tracker_release(this: *mut c_void) -> u32 {
    tracker(this).refs.release()
}

unsafe extern "system" fn tracker_connect_from_tracker_source(this: *mut c_void) -> HResult {
    let tracker = tracker(this);
    if !tracker.connect_status.is_success() {
        return tracker.connect_status;
    }
    tracker.events.push(Event::Connect(tracker.id));
    HResult::S_OK
}

unsafe extern "system" fn tracker_disconnect_from_tracker_source(this: *mut c_void) -> HResult {
    let tracker = tracker(this);
    tracker.events.push(Event::Disconnect(tracker.id));
    HResult::S_OK
}

unsafe extern "system" fn tracker_find_tracker_targets(
    this: *mut c_void,
    callback: *mut IFindReferenceTargetsCallback,
) -> HResult {
    let tracker = tracker(this);
    tracker.events.push(Event::FindTargets(tracker.id));

    if !tracker.find_status.is_success() {
        return tracker.find_status;
    }

    let Some(callback) = callback.as_ref() else {
        return HResult::E_POINTER;
    };

    for &target in &tracker.targets {
        if let Err(err) = callback.found_tracker_target(target) {
            if !tracker.swallow_callback_failures {
                return err.into();
            }
        }
    }

    HResult::S_OK
}

unsafe extern "system" fn tracker_get_reference_tracker_manager(
    this: *mut c_void,
    out: *mut *mut IReferenceTrackerManager,
) -> HResult {
    let tracker = tracker(this);
    if out.is_null() {
        return HResult::E_POINTER;
    }

    match tracker.manager.as_ref() {
        Some(manager) => {
            manager.refs.add();
            *out = manager.as_ptr();
            HResult::S_OK
        }
        None => {
            *out = core::ptr::null_mut();
            HResult::E_FAIL
        }
    }
}

unsafe extern "system" fn tracker_add_ref_from_tracker_source(this: *mut c_void) -> HResult {
    let tracker = tracker(this);
    tracker.events.push(Event::AddRefFromSource(tracker.id));
    HResult::S_OK
}

unsafe extern "system" fn tracker_release_from_tracker_source(this: *mut c_void) -> HResult {
    let tracker = tracker(this);
    tracker.events.push(Event::ReleaseFromSource(tracker.id));
    HResult::S_OK
}

unsafe extern "system" fn tracker_peg_from_tracker_source(this: *mut c_void) -> HResult {
    let tracker = tracker(this);
    tracker.events.push(Event::PegFromSource(tracker.id));
    HResult::S_OK
}

// ============================================================================
// Tracker target (managed object wrapper or foreign object)
// ============================================================================

static TARGET_VTBL: IReferenceTrackerTargetVtbl = IReferenceTrackerTargetVtbl {
    base: IUnknownVtbl {
        query_interface: target_query_interface,
        add_ref: target_add_ref,
        release: target_release,
    },
    add_ref_from_reference_tracker: target_add_ref_from_reference_tracker,
    release_from_reference_tracker: target_release_from_reference_tracker,
    peg: target_peg,
    unpeg: target_unpeg,
};

/// Object answering `IReferenceTrackerTarget`
#[repr(C)]
pub struct MockTarget {
    vtbl: *const IReferenceTrackerTargetVtbl,
    refs: Refs,
    tracker_refs: AtomicU32,
    pegged: AtomicBool,
}

// Safety: all state is atomic
unsafe impl Send for MockTarget {}
unsafe impl Sync for MockTarget {}

impl MockTarget {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            vtbl: &TARGET_VTBL,
            refs: Refs::default(),
            tracker_refs: AtomicU32::new(0),
            pegged: AtomicBool::new(false),
        })
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.count.load(Ordering::SeqCst)
    }

    pub fn tracker_ref_count(&self) -> u32 {
        self.tracker_refs.load(Ordering::SeqCst)
    }

    pub fn is_pegged(&self) -> bool {
        self.pegged.load(Ordering::SeqCst)
    }

    pub fn as_ptr(&self) -> *mut IReferenceTrackerTarget {
        self as *const Self as *mut IReferenceTrackerTarget
    }

    pub fn as_interface(&self) -> &IReferenceTrackerTarget {
        unsafe { &*self.as_ptr() }
    }

    /// The same object viewed as its identity interface
    pub fn as_unknown(&self) -> &IUnknown {
        unsafe { &*(self as *const Self as *const IUnknown) }
    }
}

unsafe fn target<'a>(this: *mut c_void) -> &'a MockTarget {
    &*(this as *const MockTarget)
}

unsafe extern "system" fn target_query_interface(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> HResult {
    answer_query(this, &target(this).refs, iid, out, &[IReferenceTrackerTarget::IID])
}

unsafe extern "system" fn target_add_ref(this: *mut c_void) -> u32 {
    target(this).refs.add()
}

unsafe extern "system" fn target_release(this: *mut c_void) -> u32 {
    target(this).refs.release()
}

unsafe extern "system" fn target_add_ref_from_reference_tracker(this: *mut c_void) -> u32 {
    target(this).tracker_refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn target_release_from_reference_tracker(this: *mut c_void) -> u32 {
    target(this).tracker_refs.fetch_sub(1, Ordering::SeqCst) - 1
}

unsafe extern "system" fn target_peg(this: *mut c_void) -> HResult {
    target(this).pegged.store(true, Ordering::SeqCst);
    HResult::S_OK
}

unsafe extern "system" fn target_unpeg(this: *mut c_void) -> HResult {
    target(this).pegged.store(false, Ordering::SeqCst);
    HResult::S_OK
}

// ============================================================================
// Managed runtime
// ============================================================================

/// Calls observed on the managed runtime side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCall {
    Collect(GcRequest),
    WaitForFinalizer,
    ReleaseThreadObjects(ObjectHandle),
    GetOrCreateTarget {
        runtime_impl: ObjectHandle,
        identity: usize,
        object_flags: CreateObjectFlags,
        interface_flags: CreateComInterfaceFlags,
    },
    AddPressure(u64),
    RemovePressure(u64),
}

/// Managed runtime double: records calls and knows which targets are its wrappers
pub struct MockRuntime {
    wrappers: DashMap<usize, ObjectHandle>,
    calls: Mutex<Vec<RuntimeCall>>,
    failure: Mutex<Option<HResult>>,
    proxy: Box<MockTarget>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wrappers: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            proxy: MockTarget::new(),
        })
    }

    /// Treat `target` as a managed object wrapper for `handle`
    pub fn register_wrapper(&self, target: &MockTarget, handle: ObjectHandle) {
        self.wrappers.insert(target.as_ptr() as usize, handle);
    }

    /// Every subsequent import fails with `status`
    pub fn fail_with(&self, status: HResult) {
        *self.failure.lock() = Some(status);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().clone()
    }

    /// Wrapper handed out by `get_or_create_tracker_target`
    pub fn proxy(&self) -> &MockTarget {
        &self.proxy
    }

    fn record(&self, call: RuntimeCall) -> TrackerResult<()> {
        self.calls.lock().push(call);
        match *self.failure.lock() {
            Some(status) => Err(TrackerError::from(status)),
            None => Ok(()),
        }
    }
}

impl RuntimeImports for MockRuntime {
    fn request_garbage_collection(&self, request: GcRequest) -> TrackerResult<()> {
        self.record(RuntimeCall::Collect(request))
    }

    fn wait_for_finalizer(&self) -> TrackerResult<()> {
        self.record(RuntimeCall::WaitForFinalizer)
    }

    fn release_external_objects_from_current_thread(&self, runtime_impl: ObjectHandle) -> TrackerResult<()> {
        self.record(RuntimeCall::ReleaseThreadObjects(runtime_impl))
    }

    fn get_or_create_tracker_target(
        &self,
        runtime_impl: ObjectHandle,
        identity: &IUnknown,
        object_flags: CreateObjectFlags,
        interface_flags: CreateComInterfaceFlags,
    ) -> TrackerResult<ComPtr<IUnknown>> {
        self.record(RuntimeCall::GetOrCreateTarget {
            runtime_impl,
            identity: identity.as_raw() as usize,
            object_flags,
            interface_flags,
        })?;

        let proxy = self.proxy.as_unknown() as *const IUnknown as *mut IUnknown;
        let proxy = unsafe { ComPtr::from_borrowed(proxy) };
        proxy.ok_or(TrackerError::NullPointer)
    }

    fn add_memory_pressure(&self, bytes: u64) -> TrackerResult<()> {
        self.record(RuntimeCall::AddPressure(bytes))
    }

    fn remove_memory_pressure(&self, bytes: u64) -> TrackerResult<()> {
        self.record(RuntimeCall::RemovePressure(bytes))
    }

    fn map_tracker_target(&self, target: &IReferenceTrackerTarget) -> Option<ObjectHandle> {
        self.wrappers
            .get(&(target.as_raw() as usize))
            .map(|entry| *entry.value())
    }
}

// ============================================================================
// Collection pass
// ============================================================================

/// Collection pass over a fixed list of contexts, accumulating edges
#[derive(Debug, Default)]
pub struct MockPass {
    contexts: VecDeque<ExternalObjectContext>,
    edges: Vec<(ObjectHandle, ObjectHandle)>,
    yielded: usize,
    fail_enumeration_at: Option<usize>,
    edge_failure: Option<HResult>,
}

impl MockPass {
    pub fn new(contexts: impl IntoIterator<Item = ExternalObjectContext>) -> Self {
        Self {
            contexts: contexts.into_iter().collect(),
            ..Self::default()
        }
    }

    /// `next_object` fails instead of yielding the context at `index`
    pub fn failing_enumeration_at(mut self, index: usize) -> Self {
        self.fail_enumeration_at = Some(index);
        self
    }

    /// Every reported edge is rejected with `status`
    pub fn failing_edge_reports(mut self, status: HResult) -> Self {
        self.edge_failure = Some(status);
        self
    }

    pub fn edges(&self) -> &[(ObjectHandle, ObjectHandle)] {
        &self.edges
    }

    /// Contexts never pulled by the walk
    pub fn remaining(&self) -> usize {
        self.contexts.len()
    }
}

impl CollectionPass for MockPass {
    fn next_object(&mut self) -> TrackerResult<Option<ExternalObjectContext>> {
        if self.fail_enumeration_at == Some(self.yielded) {
            return Err(TrackerError::External(HResult::E_FAIL));
        }

        let next = self.contexts.pop_front();
        if next.is_some() {
            self.yielded += 1;
        }
        Ok(next)
    }

    fn found_reference_path(&mut self, source: ObjectHandle, target: ObjectHandle) -> TrackerResult<()> {
        if let Some(status) = self.edge_failure {
            return Err(TrackerError::from(status));
        }
        self.edges.push((source, target));
        Ok(())
    }
}
