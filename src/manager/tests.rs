use super::*;
use crate::abi::HResult;
use crate::error::TrackerError;
use crate::runtime::ExternalObjectContext;
use crate::testing::{Event, EventLog, MockPass, MockRuntime, MockTarget, MockTracker, MockTrackerManager};
use proptest::prelude::*;
use std::sync::Barrier;

fn handle(addr: usize) -> ObjectHandle {
    ObjectHandle::from_addr(addr)
}

/// One bridge plus the tracker runtime it talks to
///
/// Field order matters: the bridge drops first and releases the coordinator
/// while the mock is still alive.
struct Fixture {
    manager: TrackerObjectManager,
    runtime: Arc<MockRuntime>,
    events: Arc<EventLog>,
    coordinator: Box<MockTrackerManager>,
}

impl Fixture {
    fn new() -> Self {
        let events = EventLog::new();
        Self::with_coordinator(MockTrackerManager::new(events.clone()), events)
    }

    fn with_coordinator(coordinator: Box<MockTrackerManager>, events: Arc<EventLog>) -> Self {
        let runtime = MockRuntime::new();
        Self {
            manager: TrackerObjectManager::new(runtime.clone()),
            runtime,
            events,
            coordinator,
        }
    }

    fn tracker(&self, id: u32) -> Box<MockTracker> {
        MockTracker::new(id, self.events.clone()).with_manager(&self.coordinator)
    }

    fn discover(&self) {
        let tracker = self.tracker(0);
        self.manager.on_reference_tracker_found(tracker.as_interface()).unwrap();
    }

    fn wrapper(&self, target: &MockTarget, addr: usize) -> ObjectHandle {
        let wrapped = handle(addr);
        self.runtime.register_wrapper(target, wrapped);
        wrapped
    }
}

#[test]
fn test_initial_state() {
    let fixture = Fixture::new();
    let manager = &fixture.manager;

    assert!(!manager.should_walk_external_objects());
    assert!(manager.is_globally_pegged());
    assert!(!manager.has_tracking_started());
    assert_eq!(manager.stats(), TrackerStats::default());
}

#[test]
fn test_discovery_publishes_and_registers_host() {
    let fixture = Fixture::new();
    fixture.discover();

    assert!(fixture.manager.should_walk_external_objects());
    assert_eq!(fixture.coordinator.ref_count(), 1);
    assert_eq!(fixture.coordinator.host_registrations(), 1);

    let registered = fixture.coordinator.registered_host().unwrap();
    let ours = fixture.manager.host_services().as_interface();
    assert!(core::ptr::eq(registered, ours));
}

#[test]
fn test_second_discovery_is_noop() {
    let fixture = Fixture::new();
    fixture.discover();
    fixture.discover();

    assert_eq!(fixture.coordinator.ref_count(), 1);
    assert_eq!(fixture.coordinator.host_registrations(), 1);
    assert_eq!(fixture.events.count(Event::HostRegistered), 1);
}

#[test]
fn test_discovery_without_coordinator_fails() {
    let fixture = Fixture::new();
    let orphan = MockTracker::new(7, fixture.events.clone());

    let result = fixture.manager.on_reference_tracker_found(orphan.as_interface());
    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
    assert!(!fixture.manager.should_walk_external_objects());
}

#[test]
fn test_concurrent_discovery_publishes_once() {
    const THREADS: usize = 8;

    let events = EventLog::new();
    let coordinators: Vec<_> = (0..THREADS).map(|_| MockTrackerManager::new(events.clone())).collect();
    let trackers: Vec<_> = coordinators
        .iter()
        .enumerate()
        .map(|(i, coordinator)| MockTracker::new(i as u32, events.clone()).with_manager(coordinator))
        .collect();
    let manager = TrackerObjectManager::new(MockRuntime::new());
    let barrier = Barrier::new(THREADS);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = trackers
            .iter()
            .map(|tracker| {
                let (manager, barrier) = (&manager, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    manager.on_reference_tracker_found(tracker.as_interface())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.iter().all(Result::is_ok));
    assert!(manager.should_walk_external_objects());
    assert_eq!(events.count(Event::HostRegistered), 1);

    let winners: Vec<_> = coordinators.iter().filter(|c| c.host_registrations() == 1).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].ref_count(), 1);

    // Losers either released their reference or never took one
    for coordinator in coordinators.iter().filter(|c| c.host_registrations() == 0) {
        assert_eq!(coordinator.ref_count(), 0);
    }

    manager.on_shutdown();
    assert!(coordinators.iter().all(|c| c.ref_count() == 0));
}

#[test]
fn test_concurrent_discovery_all_succeed() {
    const THREADS: usize = 4;

    let fixture = Fixture::new();
    let trackers: Vec<_> = (0..THREADS as u32).map(|id| fixture.tracker(id)).collect();
    let barrier = Barrier::new(THREADS);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = trackers
            .iter()
            .map(|tracker| {
                let (manager, barrier) = (&fixture.manager, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    manager.on_reference_tracker_found(tracker.as_interface())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(fixture.coordinator.host_registrations(), 1);
    assert_eq!(fixture.coordinator.ref_count(), 1);
}

#[test]
fn test_wrapper_created_connects_before_add_ref() {
    let fixture = Fixture::new();
    let tracker = fixture.tracker(3);

    fixture.manager.after_wrapper_created(tracker.as_interface()).unwrap();

    assert_eq!(fixture.events.events(), vec![Event::Connect(3), Event::AddRefFromSource(3)]);
}

#[test]
fn test_wrapper_created_stops_on_connect_failure() {
    let fixture = Fixture::new();
    let tracker = fixture.tracker(3).failing_connect(HResult::E_FAIL);

    let result = fixture.manager.after_wrapper_created(tracker.as_interface());

    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
    assert_eq!(fixture.events.count(Event::AddRefFromSource(3)), 0);
}

#[test]
fn test_wrapper_destroyed_disconnects() {
    let fixture = Fixture::new();
    let tracker = fixture.tracker(5);

    fixture.manager.before_wrapper_destroyed(tracker.as_interface()).unwrap();

    assert_eq!(fixture.events.events(), vec![Event::Disconnect(5)]);
}

#[test]
fn test_begin_without_coordinator_is_noop() {
    let fixture = Fixture::new();
    let tracker = fixture.tracker(1);
    let mut pass = MockPass::new([tracker.context(handle(0x10))]);

    assert_eq!(fixture.manager.begin_reference_tracking(&mut pass), Ok(Status::NotApplicable));
    assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::NotApplicable));

    assert!(fixture.manager.is_globally_pegged());
    assert!(!fixture.manager.has_tracking_started());
    assert_eq!(pass.remaining(), 1);
    assert!(pass.edges().is_empty());
    assert!(fixture.events.events().is_empty());
}

#[test]
fn test_end_without_begin_is_noop() {
    let fixture = Fixture::new();
    fixture.discover();

    assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::NotApplicable));
    assert_eq!(fixture.events.count(Event::TrackingCompleted), 0);
    assert!(fixture.manager.is_globally_pegged());
}

#[test]
fn test_walk_reports_edges_for_tracked_objects_only() {
    let fixture = Fixture::new();
    fixture.discover();

    let target = MockTarget::new();
    let wrapped = fixture.wrapper(&target, 0x200);
    let tracker = fixture.tracker(2).with_targets(&[&target]);

    let mut pass = MockPass::new([
        ExternalObjectContext::untracked(handle(0x10)),
        tracker.context(handle(0x20)),
        ExternalObjectContext::untracked(handle(0x30)),
    ]);

    assert_eq!(fixture.manager.begin_reference_tracking(&mut pass), Ok(Status::Applied));
    assert!(!fixture.manager.is_globally_pegged());
    assert!(fixture.manager.has_tracking_started());

    assert_eq!(pass.edges(), &[(handle(0x20), wrapped)]);
    assert_eq!(pass.remaining(), 0);

    assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::Applied));
    assert!(fixture.manager.is_globally_pegged());
    assert!(!fixture.manager.has_tracking_started());

    let events = fixture.events.events();
    let tail = &events[events.len() - 4..];
    assert_eq!(
        tail,
        &[
            Event::TrackingStarted,
            Event::FindTargets(2),
            Event::FindTargetsCompleted { walk_failed: false },
            Event::TrackingCompleted,
        ]
    );

    let stats = fixture.manager.stats();
    assert_eq!(stats.walks_begun, 1);
    assert_eq!(stats.walks_failed, 0);
    assert_eq!(stats.tracker_objects_visited, 1);
    assert_eq!(stats.edges_reported, 1);
}

#[test]
fn test_foreign_targets_are_skipped() {
    let fixture = Fixture::new();
    fixture.discover();

    let ours = MockTarget::new();
    let foreign = MockTarget::new();
    let wrapped = fixture.wrapper(&ours, 0x200);
    let tracker = fixture.tracker(1).with_targets(&[&foreign, &ours, &foreign]);

    let mut pass = MockPass::new([tracker.context(handle(0x10))]);
    fixture.manager.begin_reference_tracking(&mut pass).unwrap();
    fixture.manager.end_reference_tracking().unwrap();

    assert_eq!(pass.edges(), &[(handle(0x10), wrapped)]);
    assert_eq!(fixture.manager.stats().foreign_targets_skipped, 2);
}

#[test]
fn test_failed_walk_stops_and_pegs() {
    let fixture = Fixture::new();
    fixture.discover();

    let target = MockTarget::new();
    let wrapped = fixture.wrapper(&target, 0x200);
    let first = fixture.tracker(1).with_targets(&[&target]);
    let failing = fixture.tracker(2).failing_find(HResult::E_FAIL);
    let never = fixture.tracker(3).with_targets(&[&target]);

    let mut pass = MockPass::new([
        first.context(handle(0x10)),
        failing.context(handle(0x20)),
        never.context(handle(0x30)),
    ]);

    let result = fixture.manager.begin_reference_tracking(&mut pass);
    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));

    // Pegging forced back on while the walk is still open
    assert!(fixture.manager.is_globally_pegged());
    assert!(fixture.manager.has_tracking_started());
    assert_eq!(pass.edges(), &[(handle(0x10), wrapped)]);
    assert_eq!(pass.remaining(), 1);
    assert_eq!(fixture.events.count(Event::FindTargets(3)), 0);
    assert_eq!(fixture.events.count(Event::FindTargetsCompleted { walk_failed: true }), 1);

    assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::Applied));
    assert!(fixture.manager.is_globally_pegged());
    assert!(!fixture.manager.has_tracking_started());
    assert_eq!(fixture.manager.stats().walks_failed, 1);
}

#[test]
fn test_enumeration_failure_fails_walk() {
    let fixture = Fixture::new();
    fixture.discover();

    let first = fixture.tracker(1);
    let second = fixture.tracker(2);
    let mut pass =
        MockPass::new([first.context(handle(0x10)), second.context(handle(0x20))]).failing_enumeration_at(1);

    let result = fixture.manager.begin_reference_tracking(&mut pass);
    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
    assert_eq!(fixture.events.count(Event::FindTargets(1)), 1);
    assert_eq!(fixture.events.count(Event::FindTargets(2)), 0);
    assert_eq!(fixture.events.count(Event::FindTargetsCompleted { walk_failed: true }), 1);

    fixture.manager.end_reference_tracking().unwrap();
}

#[test]
fn test_rejected_edge_fails_walk() {
    let fixture = Fixture::new();
    fixture.discover();

    let target = MockTarget::new();
    fixture.wrapper(&target, 0x200);
    let tracker = fixture.tracker(1).with_targets(&[&target]);
    let mut pass = MockPass::new([tracker.context(handle(0x10))]).failing_edge_reports(HResult::E_FAIL);

    let result = fixture.manager.begin_reference_tracking(&mut pass);
    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
    assert!(fixture.manager.is_globally_pegged());

    fixture.manager.end_reference_tracking().unwrap();
}

#[test]
fn test_null_target_fails_walk() {
    let fixture = Fixture::new();
    fixture.discover();

    let tracker = fixture.tracker(1).with_null_target();
    let mut pass = MockPass::new([tracker.context(handle(0x10))]);

    let result = fixture.manager.begin_reference_tracking(&mut pass);
    assert_eq!(result, Err(TrackerError::NullPointer));
    assert!(pass.edges().is_empty());

    fixture.manager.end_reference_tracking().unwrap();
}

#[test]
fn test_start_failure_propagates_and_end_recovers() {
    let events = EventLog::new();
    let coordinator = MockTrackerManager::new(events.clone()).failing_start(HResult::E_FAIL);
    let fixture = Fixture::with_coordinator(coordinator, events);
    fixture.discover();

    let tracker = fixture.tracker(1);
    let mut pass = MockPass::new([tracker.context(handle(0x10))]);

    let result = fixture.manager.begin_reference_tracking(&mut pass);
    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
    assert_eq!(fixture.events.count(Event::FindTargets(1)), 0);
    assert!(!fixture.manager.is_globally_pegged());

    fixture.manager.end_reference_tracking().unwrap();
    assert!(fixture.manager.is_globally_pegged());
    assert!(!fixture.manager.has_tracking_started());
}

#[test]
fn test_completion_failure_still_resets() {
    let events = EventLog::new();
    let coordinator = MockTrackerManager::new(events.clone()).failing_completion(HResult::E_FAIL);
    let fixture = Fixture::with_coordinator(coordinator, events);
    fixture.discover();

    let mut pass = MockPass::default();
    fixture.manager.begin_reference_tracking(&mut pass).unwrap();

    let result = fixture.manager.end_reference_tracking();
    assert_eq!(result, Err(TrackerError::External(HResult::E_FAIL)));
    assert!(fixture.manager.is_globally_pegged());
    assert!(!fixture.manager.has_tracking_started());
    assert_eq!(fixture.manager.stats().completion_failures, 1);

    // Next collection starts cleanly
    fixture.manager.begin_reference_tracking(&mut pass).unwrap();
    assert_eq!(fixture.manager.stats().walks_begun, 2);
    let _ = fixture.manager.end_reference_tracking();
}

#[test]
fn test_repeated_collections() {
    let fixture = Fixture::new();
    fixture.discover();

    let target = MockTarget::new();
    fixture.wrapper(&target, 0x200);
    let tracker = fixture.tracker(1).with_targets(&[&target]);

    for _ in 0..3 {
        let mut pass = MockPass::new([tracker.context(handle(0x10))]);
        assert_eq!(fixture.manager.begin_reference_tracking(&mut pass), Ok(Status::Applied));
        assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::Applied));
        assert_eq!(pass.edges().len(), 1);
    }

    let stats = fixture.manager.stats();
    assert_eq!(stats.walks_begun, 3);
    assert_eq!(stats.edges_reported, 3);
    assert_eq!(fixture.events.count(Event::TrackingCompleted), 3);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "reference tracking already started")]
fn test_double_begin_panics_in_debug() {
    let fixture = Fixture::new();
    fixture.discover();

    let mut pass = MockPass::default();
    fixture.manager.begin_reference_tracking(&mut pass).unwrap();
    let _ = fixture.manager.begin_reference_tracking(&mut pass);
}

#[test]
fn test_shutdown_releases_once() {
    let fixture = Fixture::new();
    fixture.discover();

    fixture.manager.on_shutdown();
    fixture.manager.on_shutdown();

    assert_eq!(fixture.coordinator.ref_count(), 0);
    assert_eq!(fixture.coordinator.release_count(), 1);
    assert!(!fixture.manager.should_walk_external_objects());

    let mut pass = MockPass::default();
    assert_eq!(fixture.manager.begin_reference_tracking(&mut pass), Ok(Status::NotApplicable));
}

#[test]
fn test_concurrent_shutdown_releases_once() {
    const THREADS: usize = 8;

    let fixture = Fixture::new();
    fixture.discover();
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let (manager, barrier) = (&fixture.manager, &barrier);
            scope.spawn(move || {
                barrier.wait();
                manager.on_shutdown();
            });
        }
    });

    assert_eq!(fixture.coordinator.ref_count(), 0);
    assert_eq!(fixture.coordinator.release_count(), 1);
}

#[test]
fn test_drop_releases_coordinator() {
    let events = EventLog::new();
    let coordinator = MockTrackerManager::new(events.clone());
    let tracker = MockTracker::new(1, events).with_manager(&coordinator);

    {
        let manager = TrackerObjectManager::new(MockRuntime::new());
        manager.on_reference_tracker_found(tracker.as_interface()).unwrap();
        assert_eq!(coordinator.ref_count(), 1);
    }

    assert_eq!(coordinator.ref_count(), 0);
}

#[test]
fn test_end_after_shutdown_restores_defaults() {
    let fixture = Fixture::new();
    fixture.discover();

    let mut pass = MockPass::default();
    fixture.manager.begin_reference_tracking(&mut pass).unwrap();
    fixture.manager.on_shutdown();

    assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::NotApplicable));
    assert!(fixture.manager.is_globally_pegged());
    assert!(!fixture.manager.has_tracking_started());
    assert_eq!(fixture.events.count(Event::TrackingCompleted), 0);

    // Rediscovery starts a clean bracket
    fixture.discover();
    assert_eq!(fixture.manager.begin_reference_tracking(&mut pass), Ok(Status::Applied));
    assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::Applied));
    assert!(fixture.manager.is_globally_pegged());
}

#[test]
fn test_runtime_impl_through_manager() {
    let fixture = Fixture::new();
    let runtime_impl = handle(0x4000);

    assert!(fixture
        .manager
        .try_set_reference_tracker_host_runtime_impl(runtime_impl, ObjectHandle::NULL));
    assert!(!fixture
        .manager
        .try_set_reference_tracker_host_runtime_impl(handle(0x5000), ObjectHandle::NULL));
    assert_eq!(fixture.manager.host_services().runtime_impl(), Some(runtime_impl));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Edges are exactly the (source, wrapper) pairs of tracked objects, in order,
    /// and every bracket leaves the bridge pegged.
    #[test]
    fn prop_walk_reports_every_owned_edge(
        shape in prop::collection::vec(
            (any::<bool>(), prop::collection::vec(any::<bool>(), 0..4)),
            0..8,
        )
    ) {
        let fixture = Fixture::new();
        fixture.discover();

        let ours = MockTarget::new();
        let foreign = MockTarget::new();
        let wrapped = fixture.wrapper(&ours, 0x9000);

        let mut trackers = Vec::new();
        let mut expected = Vec::new();
        let mut contexts = Vec::new();

        for (i, (tracked, targets)) in shape.iter().enumerate() {
            let source = handle(0x100 + i * 0x10);
            if !*tracked {
                contexts.push(ExternalObjectContext::untracked(source));
                continue;
            }

            let refs: Vec<&MockTarget> = targets
                .iter()
                .map(|owned| if *owned { &*ours } else { &*foreign })
                .collect();
            expected.extend(targets.iter().filter(|owned| **owned).map(|_| (source, wrapped)));

            let tracker = fixture.tracker(i as u32).with_targets(&refs);
            contexts.push(tracker.context(source));
            trackers.push(tracker);
        }

        let mut pass = MockPass::new(contexts);
        prop_assert_eq!(fixture.manager.begin_reference_tracking(&mut pass), Ok(Status::Applied));
        prop_assert_eq!(fixture.manager.end_reference_tracking(), Ok(Status::Applied));

        prop_assert_eq!(pass.edges(), expected.as_slice());
        prop_assert!(fixture.manager.is_globally_pegged());
        prop_assert_eq!(fixture.manager.stats().tracker_objects_visited, trackers.len());
    }
}
