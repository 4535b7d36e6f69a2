//! Bridge statistics (lock-free counters, snapshot on read)

use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of reference tracking activity for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub walks_begun: usize,
    pub walks_failed: usize,
    pub tracker_objects_visited: usize,
    pub edges_reported: usize,
    pub foreign_targets_skipped: usize,
    pub completion_failures: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    walks_begun: AtomicUsize,
    walks_failed: AtomicUsize,
    tracker_objects_visited: AtomicUsize,
    edges_reported: AtomicUsize,
    foreign_targets_skipped: AtomicUsize,
    completion_failures: AtomicUsize,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn walk_begun(&self) {
        self.walks_begun.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn walk_failed(&self) {
        self.walks_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn tracker_visited(&self) {
        self.tracker_objects_visited.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn edge_reported(&self) {
        self.edges_reported.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn foreign_target_skipped(&self) {
        self.foreign_targets_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn completion_failed(&self) {
        self.completion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TrackerStats {
        TrackerStats {
            walks_begun: self.walks_begun.load(Ordering::Relaxed),
            walks_failed: self.walks_failed.load(Ordering::Relaxed),
            tracker_objects_visited: self.tracker_objects_visited.load(Ordering::Relaxed),
            edges_reported: self.edges_reported.load(Ordering::Relaxed),
            foreign_targets_skipped: self.foreign_targets_skipped.load(Ordering::Relaxed),
            completion_failures: self.completion_failures.load(Ordering::Relaxed),
        }
    }
}
