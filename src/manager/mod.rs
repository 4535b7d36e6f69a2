//! Tracker object manager - coordinator registry and walk orchestration
//!
//! Design: one shared context object per process, passed by reference:
//! 1. Coordinator registry (set-once `IReferenceTrackerManager`, CAS publish)
//! 2. Wrapper lifecycle notifications (connect/add-ref, disconnect)
//! 3. Begin/end reference tracking bracket around a collection pause
//!
//! No locks are taken. Racing publishers resolve with first-writer-wins; the
//! pegging and active-walk flags are only written inside a collection pause.

use crate::abi::{ComPtr, IReferenceTracker, IReferenceTrackerHost, IReferenceTrackerManager, Interface};
use crate::error::{Status, TrackerResult};
use crate::host::HostServices;
use crate::logging::{
    debug, debug_span, log_completion_failure, log_discovery_race_lost, log_shutdown_release,
    log_tracker_manager_published, log_walk_complete, log_walk_start,
};
use crate::runtime::{CollectionPass, ObjectHandle, RuntimeImports};
use crate::stats::{StatsCounters, TrackerStats};
use crate::walk;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[cfg(test)]
mod tests;

/// Shared bridge state between the collector and the tracker runtime
///
/// Must outlive every call the tracker runtime makes into the registered host
/// services; in practice it lives for the whole process.
pub struct TrackerObjectManager {
    host: Box<HostServices>,
    runtime: Arc<dyn RuntimeImports>,
    /// The one and only coordinator instance (owns one reference once published)
    tracker_manager: AtomicPtr<IReferenceTrackerManager>,
    has_tracking_started: AtomicBool,
    /// Global pegging: every wrapper is treated as reachable while set
    pegging: AtomicBool,
    counters: StatsCounters,
}

impl TrackerObjectManager {
    pub fn new(runtime: Arc<dyn RuntimeImports>) -> Self {
        Self {
            host: Box::new(HostServices::new(Arc::clone(&runtime))),
            runtime,
            tracker_manager: AtomicPtr::new(core::ptr::null_mut()),
            has_tracking_started: AtomicBool::new(false),
            pegging: AtomicBool::new(true),
            counters: StatsCounters::default(),
        }
    }

    /// Host services registered with the coordinator
    #[inline]
    pub fn host_services(&self) -> &HostServices {
        &self.host
    }

    /// Attempt to set the runtime implementation backing host services
    pub fn try_set_reference_tracker_host_runtime_impl(
        &self,
        candidate: ObjectHandle,
        current: ObjectHandle,
    ) -> bool {
        self.host.try_set_runtime_impl(candidate, current)
    }

    /// Whether walking external objects is needed (a coordinator was found)
    #[inline]
    pub fn should_walk_external_objects(&self) -> bool {
        !self.tracker_manager.load(Ordering::Acquire).is_null()
    }

    #[inline]
    pub fn is_globally_pegged(&self) -> bool {
        self.pegging.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn has_tracking_started(&self) -> bool {
        self.has_tracking_started.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TrackerStats {
        self.counters.snapshot()
    }

    #[inline]
    fn tracker_manager(&self) -> Option<&IReferenceTrackerManager> {
        let manager = self.tracker_manager.load(Ordering::Acquire);
        // Safety: once published the pointer holds a reference until shutdown
        unsafe { manager.as_ref() }
    }

    /// Called the first time an external object exposing `IReferenceTracker` is seen
    ///
    /// Losing the publish race is not an error: the winner's coordinator is
    /// authoritative and the local reference is released.
    pub fn on_reference_tracker_found(&self, tracker: &IReferenceTracker) -> TrackerResult<()> {
        if self.should_walk_external_objects() {
            return Ok(());
        }

        let manager = tracker.get_reference_tracker_manager()?;
        let host: ComPtr<IReferenceTrackerHost> = self.host.as_interface().query()?;

        match self.tracker_manager.compare_exchange(
            core::ptr::null_mut(),
            manager.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Ownership has been transferred
                let manager = manager.into_raw();
                log_tracker_manager_published(manager as *const ());
                let published = unsafe { &*manager };
                published.set_reference_tracker_host(&host)?;
            }
            Err(winner) => {
                log_discovery_race_lost(winner as *const ());
            }
        }

        Ok(())
    }

    /// Notify the tracker runtime that a wrapper now references `tracker`
    pub fn after_wrapper_created(&self, tracker: &IReferenceTracker) -> TrackerResult<()> {
        // Connect first so a reported reference never exceeds the connected state
        tracker.connect_from_tracker_source()?;
        tracker.add_ref_from_tracker_source()?;
        Ok(())
    }

    /// Notify the tracker runtime that the wrapper for `tracker` is about to go away
    ///
    /// Fires at the same point as a short weak handle so the tracker runtime can
    /// disconnect weak references and stop delivering events.
    pub fn before_wrapper_destroyed(&self, tracker: &IReferenceTracker) -> TrackerResult<()> {
        tracker.disconnect_from_tracker_source()
    }

    /// Start of a collection: hand liveness decisions to the reference walk
    pub fn begin_reference_tracking(&self, pass: &mut dyn CollectionPass) -> TrackerResult<Status> {
        let Some(manager) = self.tracker_manager() else {
            return Ok(Status::NotApplicable);
        };

        debug_assert!(!self.has_tracking_started(), "reference tracking already started");
        debug_assert!(self.is_globally_pegged(), "global pegging cleared outside a walk");

        self.has_tracking_started.store(true, Ordering::SeqCst);

        // From here the tracker runtime decides what stays pegged
        self.pegging.store(false, Ordering::SeqCst);

        self.counters.walk_begun();
        let _span = debug_span!(target: "tracker", "reference_walk").entered();
        log_walk_start();
        let start = Instant::now();
        let before = self.counters.snapshot();

        // Coordinator locks its reference cache here
        manager.reference_tracking_started()?;

        let result = walk::walk_external_tracker_objects(
            manager,
            &*self.runtime,
            pass,
            &self.pegging,
            &self.counters,
        );

        let after = self.counters.snapshot();
        log_walk_complete(
            start.elapsed().as_micros() as u64,
            after.tracker_objects_visited - before.tracker_objects_visited,
            after.edges_reported - before.edges_reported,
            result.is_err(),
        );

        result.map(|()| Status::Applied)
    }

    /// End of a collection: restore global pegging whatever happened
    ///
    /// The completion status is returned for observability; a failure never
    /// prevents the reset.
    pub fn end_reference_tracking(&self) -> TrackerResult<Status> {
        if !self.has_tracking_started() {
            return Ok(Status::NotApplicable);
        }

        // Coordinator applies its peg/unpeg decisions and unlocks its cache.
        // It may already have been released by shutdown; the flags reset anyway.
        let result = match self.tracker_manager() {
            Some(manager) => manager.reference_tracking_completed().map(|()| Status::Applied),
            None => Ok(Status::NotApplicable),
        };
        if let Err(err) = &result {
            self.counters.completion_failed();
            log_completion_failure(err);
        }

        self.pegging.store(true, Ordering::SeqCst);
        self.has_tracking_started.store(false, Ordering::SeqCst);
        debug!(target: "tracker", "reference tracking ended");

        result
    }

    /// Release the coordinator; only the caller that observes it does so
    pub fn on_shutdown(&self) {
        let manager = self.tracker_manager.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if manager.is_null() {
            return;
        }

        log_shutdown_release(manager as *const ());
        // Safety: the published pointer carried exactly one reference
        drop(unsafe { ComPtr::from_raw(manager) });
    }
}

impl Drop for TrackerObjectManager {
    fn drop(&mut self) {
        self.on_shutdown();
    }
}
