//! Prometheus metrics infrastructure
//!
//! The exporter serves `/metrics`; [`JobMetrics`] records the outcome of each
//! background job cycle (matching batch, offer expiry, timeout sweep, ...).

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Start the Prometheus exporter on `0.0.0.0:<port>`
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Metrics for one periodic job
///
/// * `dispatch_job_runs_total{job, outcome}` - cycles by outcome
/// * `dispatch_job_duration_seconds{job}` - cycle duration
/// * `dispatch_job_items_total{job}` - entities processed
/// * `dispatch_job_running{job}` - 1 while a cycle is in flight
#[derive(Clone)]
pub struct JobMetrics {
    completed: Counter,
    failed: Counter,
    skipped: Counter,
    items: Counter,
    duration: Histogram,
    running: Gauge,
    job: String,
}

impl JobMetrics {
    pub fn new(job: &str) -> Self {
        let name = job.to_string();

        Self {
            completed: counter!("dispatch_job_runs_total", "job" => name.clone(), "outcome" => "completed"),
            failed: counter!("dispatch_job_runs_total", "job" => name.clone(), "outcome" => "failed"),
            skipped: counter!("dispatch_job_runs_total", "job" => name.clone(), "outcome" => "skipped"),
            items: counter!("dispatch_job_items_total", "job" => name.clone()),
            duration: histogram!("dispatch_job_duration_seconds", "job" => name.clone()),
            running: gauge!("dispatch_job_running", "job" => name.clone()),
            job: name,
        }
    }

    pub fn record_completed(&self, duration: Duration, items: u64) {
        self.completed.increment(1);
        self.items.increment(items);
        self.duration.record(duration.as_secs_f64());
    }

    pub fn record_failed(&self, duration: Duration) {
        self.failed.increment(1);
        self.duration.record(duration.as_secs_f64());
    }

    /// A cycle that did not run, e.g. another instance held the batch lock
    pub fn record_skipped(&self) {
        self.skipped.increment(1);
    }

    pub fn job(&self) -> &str {
        &self.job
    }
}

/// Marks a job cycle as running and records its outcome on drop.
///
/// Without a call to [`JobRunGuard::complete`] or [`JobRunGuard::skip`] the
/// cycle counts as failed.
pub struct JobRunGuard<'a> {
    metrics: &'a JobMetrics,
    start: Instant,
    outcome: RunOutcome,
}

enum RunOutcome {
    Failed,
    Completed(u64),
    Skipped,
}

impl<'a> JobRunGuard<'a> {
    pub fn new(metrics: &'a JobMetrics) -> Self {
        metrics.running.set(1.0);
        Self {
            metrics,
            start: Instant::now(),
            outcome: RunOutcome::Failed,
        }
    }

    pub fn complete(&mut self, items: u64) {
        self.outcome = RunOutcome::Completed(items);
    }

    pub fn skip(&mut self) {
        self.outcome = RunOutcome::Skipped;
    }
}

impl Drop for JobRunGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        match self.outcome {
            RunOutcome::Completed(items) => self.metrics.record_completed(elapsed, items),
            RunOutcome::Skipped => self.metrics.record_skipped(),
            RunOutcome::Failed => self.metrics.record_failed(elapsed),
        }
        self.metrics.running.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_metrics_without_recorder() {
        // No recorder installed: handles are no-ops
        let metrics = JobMetrics::new("matching-batch");
        assert_eq!(metrics.job(), "matching-batch");

        let mut guard = JobRunGuard::new(&metrics);
        guard.complete(3);
        drop(guard);

        let mut skipped = JobRunGuard::new(&metrics);
        skipped.skip();
        drop(skipped);

        let _failed = JobRunGuard::new(&metrics);
    }
}
