//! Virtual time table (C5): eventually consistent per-payload-fingerprint
//! execution time samples, plus the scheduler's global virtual clock.
//!
//! Updates intentionally skip fine-grained per-entry locking (§3 "multiple
//! workers may update the same entry without fine-grained locking; readers
//! accept stale values") — a single coarse mutex guards the whole map, and
//! the estimates it returns are read without any claim that they reflect
//! the very latest sample.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ExecutionTimeModel;

/// Running timing statistics for one payload fingerprint.
#[derive(Debug, Clone, Copy)]
struct TimingEntry {
    avg_nanos: f64,
    best_nanos: f64,
    worst_nanos: f64,
    samples: u64,
}

impl TimingEntry {
    fn first(sample_nanos: f64) -> Self {
        Self {
            avg_nanos: sample_nanos,
            best_nanos: sample_nanos,
            worst_nanos: sample_nanos,
            samples: 1,
        }
    }

    /// Folds a new sample in as a running mean, widening the best/worst
    /// envelope as new extremes are observed (the lower/upper confidence
    /// estimates of §3).
    fn record(&mut self, sample_nanos: f64) {
        self.samples += 1;
        let n = self.samples as f64;
        self.avg_nanos += (sample_nanos - self.avg_nanos) / n;
        if sample_nanos < self.best_nanos {
            self.best_nanos = sample_nanos;
        }
        if sample_nanos > self.worst_nanos {
            self.worst_nanos = sample_nanos;
        }
    }

    fn estimate(&self, model: ExecutionTimeModel) -> f64 {
        match model {
            ExecutionTimeModel::Average => self.avg_nanos,
            ExecutionTimeModel::Best => self.best_nanos,
            ExecutionTimeModel::Worst => self.worst_nanos,
        }
    }
}

/// Default estimate handed out for a fingerprint never measured before.
const UNKNOWN_ESTIMATE_NANOS: f64 = 1.0;

/// Eventually consistent timing samples keyed by payload fingerprint, plus
/// a monotonic virtual clock that advances with every recorded sample.
pub struct VirtualTimeTable {
    entries: Mutex<HashMap<u64, TimingEntry>>,
    now_nanos: AtomicU64,
}

impl VirtualTimeTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            now_nanos: AtomicU64::new(0),
        }
    }

    /// Records a completed execution of `fingerprint` and advances `now()`.
    pub fn record(&self, fingerprint: u64, elapsed: Duration) {
        let sample = elapsed.as_nanos().min(u64::MAX as u128) as f64;
        self.entries
            .lock()
            .entry(fingerprint)
            .and_modify(|e| e.record(sample))
            .or_insert_with(|| TimingEntry::first(sample));
        self.now_nanos.fetch_add(sample as u64, Ordering::Relaxed);
    }

    /// Estimated execution time in nanoseconds under the configured model,
    /// or a small default for a fingerprint with no samples yet.
    pub fn estimate_nanos(&self, fingerprint: u64, model: ExecutionTimeModel) -> f64 {
        self.entries
            .lock()
            .get(&fingerprint)
            .map(|e| e.estimate(model))
            .unwrap_or(UNKNOWN_ESTIMATE_NANOS)
    }

    pub fn sample_count(&self, fingerprint: u64) -> u64 {
        self.entries.lock().get(&fingerprint).map(|e| e.samples).unwrap_or(0)
    }

    /// The scheduler's global virtual clock: a monotonically increasing
    /// accumulator of nanoseconds attributed to completed work, not wall time.
    pub fn now(&self) -> u64 {
        self.now_nanos.load(Ordering::Relaxed)
    }
}

impl Default for VirtualTimeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fingerprint_returns_default_estimate() {
        let t = VirtualTimeTable::new();
        assert_eq!(t.estimate_nanos(1, ExecutionTimeModel::Average), UNKNOWN_ESTIMATE_NANOS);
        assert_eq!(t.sample_count(1), 0);
    }

    #[test]
    fn record_updates_running_average_and_envelope() {
        let t = VirtualTimeTable::new();
        t.record(7, Duration::from_nanos(100));
        t.record(7, Duration::from_nanos(300));
        assert_eq!(t.sample_count(7), 2);
        assert_eq!(t.estimate_nanos(7, ExecutionTimeModel::Average), 200.0);
        assert_eq!(t.estimate_nanos(7, ExecutionTimeModel::Best), 100.0);
        assert_eq!(t.estimate_nanos(7, ExecutionTimeModel::Worst), 300.0);
    }

    #[test]
    fn now_advances_with_each_measurement() {
        let t = VirtualTimeTable::new();
        assert_eq!(t.now(), 0);
        t.record(1, Duration::from_nanos(50));
        assert_eq!(t.now(), 50);
        t.record(2, Duration::from_nanos(25));
        assert_eq!(t.now(), 75);
    }
}
