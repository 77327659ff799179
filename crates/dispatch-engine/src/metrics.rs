//! Metrics for the dispatch engine
//!
//! In-process atomic counters exposed through [`EngineMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram in microseconds (count / sum / min / max)
#[derive(Debug)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.min.fetch_min(value_us, Ordering::Relaxed);
        self.max.fetch_max(value_us, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> HistogramStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        HistogramStats {
            count,
            sum_us: sum,
            avg_us: if count > 0 { sum / count } else { 0 },
            min_us: if count > 0 { self.min.load(Ordering::Relaxed) } else { 0 },
            max_us: self.max.load(Ordering::Relaxed),
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum_us: u64,
    pub avg_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub batch_runs: Counter,
    pub batch_runs_skipped: Counter,
    pub requests_claimed: Counter,
    pub requests_matched: Counter,
    pub requests_no_driver: Counter,
    pub requests_failed: Counter,
    pub requests_retried: Counter,
    pub requests_redispatched: Counter,
    pub requests_timed_out: Counter,
    pub calls_offered: Counter,
    pub calls_accepted: Counter,
    pub calls_rejected: Counter,
    pub calls_expired: Counter,
    pub calls_cancelled: Counter,
    pub rides_requested: Counter,
    pub rides_cancelled: Counter,
    pub rides_completed: Counter,
    pub surge_updates: Counter,
    pub events_published: Counter,
    pub publish_failures: Counter,
    pub messages_redelivered: Counter,
    pub messages_quarantined: Counter,
    pub batch_latency: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch_latency(&self, duration: Duration) {
        self.batch_latency.record(duration.as_micros() as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batch_runs: self.batch_runs.get(),
            batch_runs_skipped: self.batch_runs_skipped.get(),
            requests_claimed: self.requests_claimed.get(),
            requests_matched: self.requests_matched.get(),
            requests_no_driver: self.requests_no_driver.get(),
            requests_failed: self.requests_failed.get(),
            requests_retried: self.requests_retried.get(),
            requests_redispatched: self.requests_redispatched.get(),
            requests_timed_out: self.requests_timed_out.get(),
            calls_offered: self.calls_offered.get(),
            calls_accepted: self.calls_accepted.get(),
            calls_rejected: self.calls_rejected.get(),
            calls_expired: self.calls_expired.get(),
            calls_cancelled: self.calls_cancelled.get(),
            rides_requested: self.rides_requested.get(),
            rides_cancelled: self.rides_cancelled.get(),
            rides_completed: self.rides_completed.get(),
            surge_updates: self.surge_updates.get(),
            events_published: self.events_published.get(),
            publish_failures: self.publish_failures.get(),
            messages_redelivered: self.messages_redelivered.get(),
            messages_quarantined: self.messages_quarantined.get(),
            batch_latency: self.batch_latency.get_stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub batch_runs: u64,
    pub batch_runs_skipped: u64,
    pub requests_claimed: u64,
    pub requests_matched: u64,
    pub requests_no_driver: u64,
    pub requests_failed: u64,
    pub requests_retried: u64,
    pub requests_redispatched: u64,
    pub requests_timed_out: u64,
    pub calls_offered: u64,
    pub calls_accepted: u64,
    pub calls_rejected: u64,
    pub calls_expired: u64,
    pub calls_cancelled: u64,
    pub rides_requested: u64,
    pub rides_cancelled: u64,
    pub rides_completed: u64,
    pub surge_updates: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub messages_redelivered: u64,
    pub messages_quarantined: u64,
    pub batch_latency: HistogramStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_stats() {
        let h = Histogram::new();
        assert_eq!(h.get_stats().min_us, 0);

        h.record(300);
        h.record(100);
        h.record(200);
        let stats = h.get_stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.avg_us, 200);
        assert_eq!(stats.min_us, 100);
        assert_eq!(stats.max_us, 300);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = EngineMetrics::new();
        m.calls_offered.add(3);
        m.calls_accepted.increment();
        m.record_batch_latency(Duration::from_millis(2));

        let snap = m.snapshot();
        assert_eq!(snap.calls_offered, 3);
        assert_eq!(snap.calls_accepted, 1);
        assert_eq!(snap.batch_latency.max_us, 2000);
    }
}
