use crate::types::{ResultStatus, WorkerStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Immutable point-in-time aggregate of orchestrator activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Submitted tasks that reached a terminal state.
    pub tasks_processed: u64,
    /// Fully successful tasks.
    pub success_count: u64,
    /// Tasks that delivered a best-effort partial result.
    pub partial_count: u64,
    /// Tasks with no usable result.
    pub failure_count: u64,
    /// Tasks cancelled before completing (tracked apart from failures).
    pub cancelled_count: u64,
    /// Mean end-to-end task latency in milliseconds.
    pub avg_latency_ms: f64,
    /// 95th-percentile end-to-end task latency in milliseconds, estimated
    /// from fixed latency buckets and reported as the covering bucket's
    /// upper bound.
    pub p95_latency_ms: u64,
    /// Cumulative per-worker execution statistics.
    pub per_worker: HashMap<String, WorkerStats>,
}

/// Inclusive upper bounds of the fixed log-scale latency buckets, in
/// milliseconds. The final bound catches everything slower; its percentile is
/// reported as the maximum latency observed in the window.
const LATENCY_BUCKET_BOUNDS_MS: [u64; 16] = [
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, u64::MAX,
];

#[derive(Default)]
struct MetricsInner {
    tasks_processed: u64,
    success_count: u64,
    partial_count: u64,
    failure_count: u64,
    cancelled_count: u64,
    total_latency_ms: u64,
    latency_buckets: [u64; LATENCY_BUCKET_BOUNDS_MS.len()],
    max_latency_ms: u64,
    per_worker: HashMap<String, WorkerStats>,
}

impl MetricsInner {
    fn snapshot(&self) -> MetricsSnapshot {
        let avg_latency_ms = if self.tasks_processed == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.tasks_processed as f64
        };
        MetricsSnapshot {
            tasks_processed: self.tasks_processed,
            success_count: self.success_count,
            partial_count: self.partial_count,
            failure_count: self.failure_count,
            cancelled_count: self.cancelled_count,
            avg_latency_ms,
            p95_latency_ms: self.p95_latency_ms(),
            per_worker: self.per_worker.clone(),
        }
    }

    fn p95_latency_ms(&self) -> u64 {
        let total: u64 = self.latency_buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = (total * 95).div_ceil(100);
        let mut seen = 0u64;
        for (bound, count) in LATENCY_BUCKET_BOUNDS_MS.iter().zip(&self.latency_buckets) {
            seen += count;
            if seen >= rank {
                return if *bound == u64::MAX {
                    self.max_latency_ms
                } else {
                    *bound
                };
            }
        }
        self.max_latency_ms
    }
}

/// Append-only, thread-safe collector of task and worker statistics.
///
/// Recording is a couple of counter bumps behind a short-lived lock;
/// latencies land in fixed log-scale buckets, so time and memory per call
/// stay constant no matter how long the window runs between resets.
#[derive(Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

impl MetricsCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed worker invocation.
    pub fn record_invocation(&self, worker_id: &str, duration: Duration, success: bool) {
        let mut inner = self.inner.lock();
        let stats = inner.per_worker.entry(worker_id.to_string()).or_default();
        if success {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }
        stats.total_processing_ms += duration.as_millis() as u64;
    }

    /// Record the terminal outcome of a submitted task.
    pub fn record_completion(&self, status: ResultStatus, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.tasks_processed += 1;
        match status {
            ResultStatus::Succeeded => inner.success_count += 1,
            ResultStatus::PartiallySucceeded => inner.partial_count += 1,
            ResultStatus::Failed => inner.failure_count += 1,
            ResultStatus::Cancelled => inner.cancelled_count += 1,
        }
        let latency_ms = latency.as_millis() as u64;
        inner.total_latency_ms += latency_ms;
        inner.max_latency_ms = inner.max_latency_ms.max(latency_ms);
        let bucket = LATENCY_BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| latency_ms <= *bound)
            .unwrap_or(LATENCY_BUCKET_BOUNDS_MS.len() - 1);
        inner.latency_buckets[bucket] += 1;
    }

    /// Produce an immutable snapshot of the current window.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().snapshot()
    }

    /// Swap in a fresh zero state and return the snapshot of the prior window.
    pub fn reset(&self) -> MetricsSnapshot {
        let mut inner = self.inner.lock();
        let previous = std::mem::take(&mut *inner);
        previous.snapshot()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_snapshot() {
        let collector = MetricsCollector::new();
        let snap = collector.snapshot();
        assert_eq!(snap.tasks_processed, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
        assert_eq!(snap.p95_latency_ms, 0);
        assert!(snap.per_worker.is_empty());
    }

    #[test]
    fn test_completion_counters() {
        let collector = MetricsCollector::new();
        collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(10));
        collector.record_completion(ResultStatus::Failed, Duration::from_millis(20));
        collector.record_completion(ResultStatus::Cancelled, Duration::from_millis(5));
        collector.record_completion(ResultStatus::PartiallySucceeded, Duration::from_millis(15));

        let snap = collector.snapshot();
        assert_eq!(snap.tasks_processed, 4);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.partial_count, 1);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.cancelled_count, 1);
        assert_eq!(
            snap.success_count + snap.partial_count + snap.failure_count + snap.cancelled_count,
            snap.tasks_processed
        );
    }

    #[test]
    fn test_latency_aggregates() {
        let collector = MetricsCollector::new();
        for ms in [10u64, 20, 30, 40] {
            collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(ms));
        }
        let snap = collector.snapshot();
        assert!((snap.avg_latency_ms - 25.0).abs() < f64::EPSILON);
        // The rank-4 sample (40ms) lands in the 50ms bucket.
        assert_eq!(snap.p95_latency_ms, 50);
    }

    #[test]
    fn test_p95_reports_covering_bucket_bound() {
        let collector = MetricsCollector::new();
        for _ in 0..95 {
            collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(40));
        }
        for _ in 0..5 {
            collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(900));
        }
        // Rank 95 of 100 is still among the fast samples.
        assert_eq!(collector.snapshot().p95_latency_ms, 50);
    }

    #[test]
    fn test_p95_overflow_bucket_reports_max_observed() {
        let collector = MetricsCollector::new();
        collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(120_000));
        assert_eq!(collector.snapshot().p95_latency_ms, 120_000);
    }

    #[test]
    fn test_latency_buckets_absorb_long_windows() {
        let collector = MetricsCollector::new();
        for i in 0..10_000u64 {
            let ms = if i % 100 < 95 { 8 } else { 400 };
            collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(ms));
        }
        let snap = collector.snapshot();
        assert_eq!(snap.tasks_processed, 10_000);
        assert_eq!(snap.p95_latency_ms, 10);
    }

    #[test]
    fn test_per_worker_stats() {
        let collector = MetricsCollector::new();
        collector.record_invocation("w1", Duration::from_millis(100), true);
        collector.record_invocation("w1", Duration::from_millis(50), false);
        collector.record_invocation("w2", Duration::from_millis(10), true);

        let snap = collector.snapshot();
        let w1 = &snap.per_worker["w1"];
        assert_eq!(w1.success_count, 1);
        assert_eq!(w1.failure_count, 1);
        assert_eq!(w1.total_processing_ms, 150);
        assert_eq!(snap.per_worker["w2"].success_count, 1);
    }

    #[test]
    fn test_reset_swaps_window() {
        let collector = MetricsCollector::new();
        collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(10));

        let prior = collector.reset();
        assert_eq!(prior.tasks_processed, 1);

        let fresh = collector.snapshot();
        assert_eq!(fresh.tasks_processed, 0);
        assert!(fresh.per_worker.is_empty());
    }

    #[test]
    fn test_no_lost_updates_under_concurrent_recording() {
        let collector = Arc::new(MetricsCollector::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let collector = Arc::clone(&collector);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    collector.record_completion(ResultStatus::Succeeded, Duration::from_millis(1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(collector.snapshot().tasks_processed, 8000);
    }
}
