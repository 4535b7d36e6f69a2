//! Reference walk - enumerate tracker objects and report edges into the managed heap
//!
//! Runs inside a collection pause. Each tracker object is asked to enumerate
//! its own outgoing references into a stack-allocated callback bound to the
//! object's managed context; every target that resolves to one of our managed
//! object wrappers becomes an edge in the collection pass.

use crate::abi::{
    write_interface, Guid, HResult, IFindReferenceTargetsCallback, IFindReferenceTargetsCallbackVtbl,
    IReferenceTrackerManager, IReferenceTrackerTarget, IUnknown, IUnknownVtbl, Interface,
};
use crate::error::{TrackerError, TrackerResult};
use crate::logging::{trace, warn};
use crate::runtime::{CollectionPass, ObjectHandle, RuntimeImports};
use crate::stats::StatsCounters;
use core::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

static FIND_TARGETS_CALLBACK_VTBL: IFindReferenceTargetsCallbackVtbl = IFindReferenceTargetsCallbackVtbl {
    base: IUnknownVtbl {
        query_interface: callback_query_interface,
        add_ref: callback_add_ref,
        release: callback_release,
    },
    found_tracker_target: callback_found_tracker_target,
};

/// Capabilities answered by `QueryInterface` on the callback object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackCapability {
    Unknown,
    FindTargets,
}

impl CallbackCapability {
    fn from_iid(iid: &Guid) -> Option<Self> {
        if *iid == IFindReferenceTargetsCallback::IID {
            Some(Self::FindTargets)
        } else if *iid == IUnknown::IID {
            Some(Self::Unknown)
        } else {
            None
        }
    }
}

/// Edge sink handed to one tracker object's `FindTrackerTargets`
#[repr(C)]
struct FindDependentWrappersCallback<'a> {
    vtbl: *const IFindReferenceTargetsCallbackVtbl,
    source: ObjectHandle,
    pass: &'a mut dyn CollectionPass,
    runtime: &'a dyn RuntimeImports,
    counters: &'a StatsCounters,
    /// First failure; the tracker object may not hand it back
    failure: Option<TrackerError>,
}

impl<'a> FindDependentWrappersCallback<'a> {
    fn new(
        source: ObjectHandle,
        pass: &'a mut dyn CollectionPass,
        runtime: &'a dyn RuntimeImports,
        counters: &'a StatsCounters,
    ) -> Self {
        Self {
            vtbl: &FIND_TARGETS_CALLBACK_VTBL,
            source,
            pass,
            runtime,
            counters,
            failure: None,
        }
    }

    #[inline]
    fn as_interface(&mut self) -> *mut IFindReferenceTargetsCallback {
        self as *mut Self as *mut IFindReferenceTargetsCallback
    }

    fn found_tracker_target(&mut self, target: Option<&IReferenceTrackerTarget>) -> TrackerResult<()> {
        if let Some(err) = self.failure {
            return Err(err);
        }

        let result = self.report_target(target);
        if let Err(err) = result {
            self.failure = Some(err);
        }
        result
    }

    fn report_target(&mut self, target: Option<&IReferenceTrackerTarget>) -> TrackerResult<()> {
        let target = target.ok_or(TrackerError::NullPointer)?;

        // Not a target we implemented
        let Some(wrapped) = self.runtime.map_tracker_target(target) else {
            self.counters.foreign_target_skipped();
            trace!(target: "tracker", address = ?target.as_raw(), "skipping foreign tracker target");
            return Ok(());
        };

        self.pass.found_reference_path(self.source, wrapped)?;
        self.counters.edge_reported();
        trace!(target: "tracker", source = ?self.source, target = ?wrapped, "reference path found");
        Ok(())
    }
}

unsafe extern "system" fn callback_query_interface(
    this: *mut c_void,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> HResult {
    let resolved = iid
        .as_ref()
        .and_then(CallbackCapability::from_iid)
        .map(|_| this);
    write_interface(out, resolved)
}

// Lifetime is the enclosing stack frame
unsafe extern "system" fn callback_add_ref(_this: *mut c_void) -> u32 {
    1
}

unsafe extern "system" fn callback_release(_this: *mut c_void) -> u32 {
    1
}

unsafe extern "system" fn callback_found_tracker_target(
    this: *mut c_void,
    target: *mut IReferenceTrackerTarget,
) -> HResult {
    let callback = &mut *(this as *mut FindDependentWrappersCallback<'_>);
    callback.found_tracker_target(target.as_ref()).into()
}

/// Ask every tracker object in the pass for its targets
///
/// Stops at the first failure. On failure the global pegging flag is forced back
/// on before the coordinator hears about it, so everything is treated as
/// reachable for this collection. The coordinator is always told the walk
/// finished, with `find_failed` set accordingly; its own status is only logged.
pub(crate) fn walk_external_tracker_objects(
    manager: &IReferenceTrackerManager,
    runtime: &dyn RuntimeImports,
    pass: &mut dyn CollectionPass,
    pegging: &AtomicBool,
    counters: &StatsCounters,
) -> TrackerResult<()> {
    let result = find_all_targets(runtime, pass, counters);

    let walk_failed = result.is_err();
    if let Err(err) = &result {
        warn!(target: "tracker", error = %err, "reference walk failed, pegging all wrappers");
        counters.walk_failed();
        pegging.store(true, Ordering::SeqCst);
    }

    if let Err(err) = manager.find_tracker_targets_completed(walk_failed) {
        warn!(target: "tracker", error = %err, walk_failed, "find tracker targets completion failed");
    }

    result
}

fn find_all_targets(
    runtime: &dyn RuntimeImports,
    pass: &mut dyn CollectionPass,
    counters: &StatsCounters,
) -> TrackerResult<()> {
    while let Some(context) = pass.next_object()? {
        let Some(tracker) = context.reference_tracker() else {
            continue;
        };

        counters.tracker_visited();

        let mut callback = FindDependentWrappersCallback::new(context.runtime_context(), &mut *pass, runtime, counters);
        // Safety: the callback outlives the synchronous enumeration call
        let status = unsafe { tracker.find_tracker_targets(callback.as_interface()) };

        // A rejected edge fails the walk even if the tracker swallowed it
        if let Some(err) = callback.failure {
            return Err(err);
        }
        status?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExternalObjectContext;
    use crate::testing::{Event, EventLog, MockPass, MockRuntime, MockTarget, MockTracker, MockTrackerManager};
    use std::sync::Arc;

    fn handle(addr: usize) -> ObjectHandle {
        ObjectHandle::from_addr(addr)
    }

    #[test]
    fn test_failed_walk_pegs_before_completion() {
        let events = EventLog::new();
        let pegging = Arc::new(AtomicBool::new(false));
        let coordinator = MockTrackerManager::new(events.clone()).with_pegging_probe(pegging.clone());
        let tracker = MockTracker::new(1, events.clone()).failing_find(HResult::E_FAIL);
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();

        let mut pass = MockPass::new([tracker.context(handle(0x10))]);
        let result = walk_external_tracker_objects(
            coordinator.as_interface(),
            &*runtime,
            &mut pass,
            &pegging,
            &counters,
        );

        assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
        assert_eq!(coordinator.pegged_at_completion(), Some(true));
        assert_eq!(events.count(Event::FindTargetsCompleted { walk_failed: true }), 1);
        assert_eq!(counters.snapshot().walks_failed, 1);
    }

    #[test]
    fn test_successful_walk_leaves_pegging_alone() {
        let events = EventLog::new();
        let pegging = Arc::new(AtomicBool::new(false));
        let coordinator = MockTrackerManager::new(events.clone()).with_pegging_probe(pegging.clone());
        let target = MockTarget::new();
        let tracker = MockTracker::new(1, events.clone()).with_targets(&[&target]);
        let runtime = MockRuntime::new();
        runtime.register_wrapper(&target, handle(0x20));
        let counters = StatsCounters::default();

        let mut pass = MockPass::new([tracker.context(handle(0x10))]);
        walk_external_tracker_objects(coordinator.as_interface(), &*runtime, &mut pass, &pegging, &counters)
            .unwrap();

        assert!(!pegging.load(Ordering::SeqCst));
        assert_eq!(coordinator.pegged_at_completion(), Some(false));
        assert_eq!(pass.edges(), &[(handle(0x10), handle(0x20))]);
        assert_eq!(events.count(Event::FindTargetsCompleted { walk_failed: false }), 1);
    }

    #[test]
    fn test_completion_status_does_not_change_result() {
        let events = EventLog::new();
        let coordinator = MockTrackerManager::new(events.clone()).failing_find_completion(HResult::E_FAIL);
        let tracker = MockTracker::new(1, events.clone());
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();
        let pegging = AtomicBool::new(false);

        let mut pass = MockPass::new([tracker.context(handle(0x10))]);
        let result =
            walk_external_tracker_objects(coordinator.as_interface(), &*runtime, &mut pass, &pegging, &counters);

        assert_eq!(result, Ok(()));
        assert!(!pegging.load(Ordering::SeqCst));
        assert_eq!(events.count(Event::FindTargetsCompleted { walk_failed: false }), 1);
        assert_eq!(counters.snapshot().walks_failed, 0);
    }

    #[test]
    fn test_untracked_contexts_are_skipped() {
        let events = EventLog::new();
        let coordinator = MockTrackerManager::new(events.clone());
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();
        let pegging = AtomicBool::new(false);

        let mut pass = MockPass::new([
            ExternalObjectContext::untracked(handle(0x10)),
            ExternalObjectContext::untracked(handle(0x20)),
        ]);
        walk_external_tracker_objects(coordinator.as_interface(), &*runtime, &mut pass, &pegging, &counters)
            .unwrap();

        assert_eq!(pass.remaining(), 0);
        assert!(pass.edges().is_empty());
        assert_eq!(counters.snapshot().tracker_objects_visited, 0);
    }

    #[test]
    fn test_callback_rejects_null_target() {
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();
        let mut pass = MockPass::default();

        let mut callback = FindDependentWrappersCallback::new(handle(0x10), &mut pass, &*runtime, &counters);
        let status = unsafe { callback_found_tracker_target(callback.as_interface().cast(), core::ptr::null_mut()) };

        assert_eq!(status, HResult::E_POINTER);
        assert!(pass.edges().is_empty());
    }

    #[test]
    fn test_callback_skips_foreign_target() {
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();
        let foreign = MockTarget::new();
        let mut pass = MockPass::default();

        let mut callback = FindDependentWrappersCallback::new(handle(0x10), &mut pass, &*runtime, &counters);
        let status = unsafe { callback_found_tracker_target(callback.as_interface().cast(), foreign.as_ptr()) };

        assert_eq!(status, HResult::S_OK);
        assert!(pass.edges().is_empty());
        assert_eq!(counters.snapshot().foreign_targets_skipped, 1);
    }

    #[test]
    fn test_callback_keeps_first_failure() {
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();
        let ours = MockTarget::new();
        runtime.register_wrapper(&ours, handle(0x20));
        let mut pass = MockPass::default();

        let mut callback = FindDependentWrappersCallback::new(handle(0x10), &mut pass, &*runtime, &counters);
        let this = callback.as_interface().cast::<c_void>();
        let first = unsafe { callback_found_tracker_target(this, core::ptr::null_mut()) };
        let second = unsafe { callback_found_tracker_target(this, ours.as_ptr()) };

        assert_eq!(first, HResult::E_POINTER);
        assert_eq!(second, HResult::E_POINTER);
        assert!(pass.edges().is_empty());
        assert_eq!(counters.snapshot().edges_reported, 0);
    }

    #[test]
    fn test_swallowed_callback_failure_stops_walk() {
        let events = EventLog::new();
        let coordinator = MockTrackerManager::new(events.clone());
        let ours = MockTarget::new();
        let runtime = MockRuntime::new();
        runtime.register_wrapper(&ours, handle(0x200));
        let counters = StatsCounters::default();
        let pegging = AtomicBool::new(false);

        let first = MockTracker::new(1, events.clone())
            .with_null_target()
            .with_targets(&[&ours])
            .ignoring_callback_failures();
        let second = MockTracker::new(2, events.clone()).with_targets(&[&ours]);

        let mut pass = MockPass::new([first.context(handle(0x10)), second.context(handle(0x20))]);
        let result =
            walk_external_tracker_objects(coordinator.as_interface(), &*runtime, &mut pass, &pegging, &counters);

        assert_eq!(result, Err(TrackerError::NullPointer));
        assert!(pass.edges().is_empty());
        assert_eq!(pass.remaining(), 1);
        assert_eq!(events.count(Event::FindTargets(2)), 0);
        assert_eq!(events.count(Event::FindTargetsCompleted { walk_failed: true }), 1);
        assert!(pegging.load(Ordering::SeqCst));
    }

    #[test]
    fn test_callback_query_interface() {
        let runtime = MockRuntime::new();
        let counters = StatsCounters::default();
        let mut pass = MockPass::default();
        let mut callback = FindDependentWrappersCallback::new(handle(0x10), &mut pass, &*runtime, &counters);
        let this = callback.as_interface().cast::<c_void>();

        let mut out = core::ptr::null_mut();
        let status = unsafe { callback_query_interface(this, &IFindReferenceTargetsCallback::IID, &mut out) };
        assert_eq!(status, HResult::S_OK);
        assert_eq!(out, this);

        let status = unsafe { callback_query_interface(this, &IReferenceTrackerManager::IID, &mut out) };
        assert_eq!(status, HResult::E_NOINTERFACE);
        assert!(out.is_null());

        assert_eq!(unsafe { callback_add_ref(this) }, 1);
        assert_eq!(unsafe { callback_release(this) }, 1);
    }
}
