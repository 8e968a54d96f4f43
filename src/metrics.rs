use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Process-wide apply counters, published through [`ApplyMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct ApplyMetrics {
    ops_applied: AtomicU64,
    batches: AtomicU64,
    batch_millis: AtomicU64,
}

impl ApplyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ops_applied(&self, n: u64) {
        self.ops_applied.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one completed apply phase.
    pub fn record_batch(&self, elapsed: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn ops_applied(&self) -> u64 {
        self.ops_applied.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            batch_total_millis: self.batch_millis.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the apply counters.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub ops_applied: u64,
    pub batches: u64,
    pub batch_total_millis: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ApplyMetrics::new();
        metrics.inc_ops_applied(3);
        metrics.inc_ops_applied(2);
        metrics.record_batch(Duration::from_millis(7));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ops_applied, 5);
        assert_eq!(snapshot.batches, 1);
        assert_eq!(snapshot.batch_total_millis, 7);
    }
}
