//! Reference walk benchmarks
//!
//! Measures a full begin/end bracket over tracker objects of varying fan-out.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tracker_bridge::testing::{EventLog, MockPass, MockRuntime, MockTarget, MockTracker, MockTrackerManager};
use tracker_bridge::{ObjectHandle, TrackerObjectManager};

fn bench_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_walk");

    for &(objects, fan_out) in &[(16usize, 1usize), (256, 4), (1024, 8)] {
        let events = EventLog::new();
        let coordinator = MockTrackerManager::new(events.clone());
        let runtime = MockRuntime::new();

        let targets: Vec<_> = (0..fan_out).map(|_| MockTarget::new()).collect();
        for (i, target) in targets.iter().enumerate() {
            runtime.register_wrapper(target, ObjectHandle::from_addr(0x10_0000 + i * 0x10));
        }
        let target_refs: Vec<&MockTarget> = targets.iter().map(|t| &**t).collect();

        let trackers: Vec<_> = (0..objects)
            .map(|i| {
                MockTracker::new(i as u32, events.clone())
                    .with_manager(&coordinator)
                    .with_targets(&target_refs)
            })
            .collect();

        let manager = TrackerObjectManager::new(runtime.clone());
        if manager.on_reference_tracker_found(trackers[0].as_interface()).is_err() {
            continue;
        }

        group.bench_with_input(
            BenchmarkId::new("objects_x_fanout", format!("{}x{}", objects, fan_out)),
            &trackers,
            |b, trackers| {
                b.iter(|| {
                    let mut pass = MockPass::new(
                        trackers
                            .iter()
                            .enumerate()
                            .map(|(i, tracker)| tracker.context(ObjectHandle::from_addr(0x1000 + i * 0x10))),
                    );
                    let _ = manager.begin_reference_tracking(&mut pass);
                    let _ = manager.end_reference_tracking();
                    events.clear();
                    black_box(pass.edges().len())
                });
            },
        );

        manager.on_shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_walk);
criterion_main!(benches);
