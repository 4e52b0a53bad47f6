// Leak detection
//
// Diagnostic companions for pooled buffers. A tracked buffer owns a
// tracker that must be closed exactly once on final release; a tracker
// dropped unclosed is a leak and is reported with the operations recorded
// against it. With deterministic destruction there is no finalizer to rely
// on: reporting happens at shell drop and in an explicit sweep on
// allocator shutdown.

use crate::config::LeakDetectionLevel;
use backtrace::Backtrace;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Cap on recorded operations per allocation; oldest entries are kept
/// since they include the allocation site.
const MAX_RECORDS: usize = 16;

/// Sampling divisor at `Simple` level: roughly 1 in 128 allocations.
const SIMPLE_SAMPLING_INTERVAL: u32 = 128;

#[derive(Debug)]
struct AccessRecord {
    hint: Option<String>,
    backtrace: Option<Backtrace>,
}

#[derive(Debug)]
struct TrackedAllocation {
    capacity: usize,
    records: Mutex<Vec<AccessRecord>>,
}

/// Allocator-wide registry of live trackers.
#[derive(Debug)]
pub struct LeakDetector {
    level: LeakDetectionLevel,
    active: DashMap<Uuid, Arc<TrackedAllocation>>,
    leaks_reported: AtomicU64,
}

impl LeakDetector {
    pub fn new(level: LeakDetectionLevel) -> Arc<Self> {
        Arc::new(Self {
            level,
            active: DashMap::new(),
            leaks_reported: AtomicU64::new(0),
        })
    }

    pub fn level(&self) -> LeakDetectionLevel {
        self.level
    }

    /// Number of leaks reported so far.
    pub fn leaks_reported(&self) -> u64 {
        self.leaks_reported.load(Ordering::Relaxed)
    }

    /// Number of allocations currently being tracked.
    pub fn active_tracked(&self) -> usize {
        self.active.len()
    }

    /// Decides per allocation whether to attach a tracker.
    pub(crate) fn track(self: &Arc<Self>, capacity: usize) -> Option<LeakTracker> {
        let sample = match self.level {
            LeakDetectionLevel::Disabled => false,
            LeakDetectionLevel::Simple => fastrand::u32(0..SIMPLE_SAMPLING_INTERVAL) == 0,
            LeakDetectionLevel::Advanced | LeakDetectionLevel::Paranoid => true,
        };
        if !sample {
            return None;
        }

        let allocation = Arc::new(TrackedAllocation {
            capacity,
            records: Mutex::new(vec![AccessRecord {
                hint: Some("allocated".to_string()),
                backtrace: Some(Backtrace::new()),
            }]),
        });
        let id = Uuid::new_v4();
        self.active.insert(id, Arc::clone(&allocation));
        Some(LeakTracker {
            id,
            detector: Arc::clone(self),
            allocation,
            closed: AtomicBool::new(false),
        })
    }

    /// Reports every still-open tracker. Meant for allocator shutdown;
    /// anything alive at that point was never released.
    pub fn report_outstanding(&self) -> usize {
        let mut reported = 0;
        self.active.retain(|id, allocation| {
            Self::emit_report(id, allocation);
            reported += 1;
            false
        });
        self.leaks_reported.fetch_add(reported as u64, Ordering::Relaxed);
        reported as usize
    }

    fn emit_report(id: &Uuid, allocation: &TrackedAllocation) {
        let records = allocation.records.lock();
        let last = records.last();
        warn!(
            tracker = %id,
            capacity = allocation.capacity,
            recorded_operations = records.len(),
            last_operation = last.and_then(|r| r.hint.as_deref()).unwrap_or("unknown"),
            "buffer leaked: released() was never called"
        );
        if let Some(backtrace) = last.and_then(|r| r.backtrace.as_ref()) {
            warn!(tracker = %id, "last recorded access:\n{:?}", backtrace);
        }
    }
}

/// Companion of a single tracked buffer.
#[derive(Debug)]
pub(crate) struct LeakTracker {
    id: Uuid,
    detector: Arc<LeakDetector>,
    allocation: Arc<TrackedAllocation>,
    closed: AtomicBool,
}

impl LeakTracker {
    /// Records a non-reference-counting operation. Below `Advanced` this
    /// is a no-op beyond the allocation record taken at creation.
    pub(crate) fn record(&self, hint: &str) {
        if !self.detector.level.records_accesses() {
            return;
        }
        let mut records = self.allocation.records.lock();
        if records.len() >= MAX_RECORDS {
            return;
        }
        records.push(AccessRecord {
            hint: Some(hint.to_string()),
            backtrace: Some(Backtrace::new()),
        });
    }

    /// Diagnostic breadcrumb; never a synchronization point.
    pub(crate) fn touch(&self, hint: &str) {
        self.record(hint);
    }

    /// Marks the tracked buffer as properly released.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.detector.active.remove(&self.id);
    }
}

impl Drop for LeakTracker {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Unclosed tracker going away: report unless a shutdown sweep
        // already claimed it.
        if self.detector.active.remove(&self.id).is_some() {
            LeakDetector::emit_report(&self.id, &self.allocation);
            self.detector.leaks_reported.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_level_tracks_nothing() {
        let detector = LeakDetector::new(LeakDetectionLevel::Disabled);
        assert!(detector.track(256).is_none());
        assert_eq!(detector.active_tracked(), 0);
    }

    #[test]
    fn paranoid_level_tracks_everything() {
        let detector = LeakDetector::new(LeakDetectionLevel::Paranoid);
        let tracker = detector.track(256).unwrap();
        assert_eq!(detector.active_tracked(), 1);
        tracker.close();
        assert_eq!(detector.active_tracked(), 0);
        drop(tracker);
        assert_eq!(detector.leaks_reported(), 0);
    }

    #[test]
    fn dropping_an_unclosed_tracker_reports_a_leak() {
        let detector = LeakDetector::new(LeakDetectionLevel::Paranoid);
        let tracker = detector.track(64).unwrap();
        drop(tracker);
        assert_eq!(detector.leaks_reported(), 1);
        assert_eq!(detector.active_tracked(), 0);
    }

    #[test]
    fn shutdown_sweep_reports_outstanding_trackers_once() {
        let detector = LeakDetector::new(LeakDetectionLevel::Paranoid);
        let tracker = detector.track(64).unwrap();
        assert_eq!(detector.report_outstanding(), 1);
        assert_eq!(detector.leaks_reported(), 1);
        // The later drop must not double-report.
        drop(tracker);
        assert_eq!(detector.leaks_reported(), 1);
    }

    #[test]
    fn advanced_level_records_operations() {
        let detector = LeakDetector::new(LeakDetectionLevel::Advanced);
        let tracker = detector.track(64).unwrap();
        tracker.record("write_bytes");
        tracker.touch("handoff to codec");
        let records = tracker.allocation.records.lock().len();
        assert_eq!(records, 3); // allocation + two accesses
        tracker.close();
    }

    #[test]
    fn simple_level_samples_sparsely() {
        let detector = LeakDetector::new(LeakDetectionLevel::Simple);
        let tracked = (0..2048)
            .filter_map(|_| detector.track(64))
            .collect::<Vec<_>>();
        // ~16 expected out of 2048 at 1/128; allow a generous band.
        assert!(tracked.len() < 200, "sampled {} of 2048", tracked.len());
        for tracker in &tracked {
            tracker.close();
        }
    }
}
