//! Background jobs
//!
//! Each job runs on its own interval until the shared cancellation token
//! fires. A failed cycle is logged and counted; the next tick runs as usual.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use config::DispatchConfig;
use observability::{JobMetrics, JobRunGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dead_letter::{DeadLetterConsumer, DeadLetterSource};
use crate::engine::MatchingEngine;
use crate::error::Result;
use crate::surge::SurgePriceService;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Result of one job cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Number of entities the cycle acted on
    Done(u64),
    /// The cycle did not run, e.g. the batch lock was held elsewhere
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerIntervals {
    pub matching_batch: Duration,
    pub call_expiry: Duration,
    pub matching_timeout: Duration,
    pub matching_retry: Duration,
    pub surge_refresh: Duration,
    pub retention: Duration,
    pub dead_letter_poll: Duration,
}

impl WorkerIntervals {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            matching_batch: Duration::from_millis(config.matching.batch_interval_ms),
            call_expiry: Duration::from_secs(config.driver_call.expiry_sweep_interval_seconds),
            matching_timeout: Duration::from_secs(config.matching.timeout_sweep_interval_seconds),
            matching_retry: Duration::from_secs(config.matching.retry_backoff_seconds.max(1)),
            surge_refresh: Duration::from_secs(config.surge.refresh_interval_seconds),
            retention: RETENTION_SWEEP_INTERVAL,
            dead_letter_poll: Duration::from_millis(config.dead_letter.poll_interval_ms),
        }
    }
}

struct DeadLetterJob {
    consumer: Arc<DeadLetterConsumer>,
    source: Arc<dyn DeadLetterSource>,
    batch_size: usize,
}

/// Schedules the matching engine, surge service and, when a source is
/// attached, the dead-letter consumer
pub struct DispatchWorker {
    engine: Arc<MatchingEngine>,
    surge: Arc<SurgePriceService>,
    intervals: WorkerIntervals,
    dead_letters: Option<DeadLetterJob>,
}

impl DispatchWorker {
    pub fn new(engine: Arc<MatchingEngine>, surge: Arc<SurgePriceService>, intervals: WorkerIntervals) -> Self {
        Self {
            engine,
            surge,
            intervals,
            dead_letters: None,
        }
    }

    /// Also drain `source` into `consumer`, up to `batch_size` records per cycle
    pub fn with_dead_letters(
        mut self,
        consumer: Arc<DeadLetterConsumer>,
        source: Arc<dyn DeadLetterSource>,
        batch_size: usize,
    ) -> Self {
        self.dead_letters = Some(DeadLetterJob {
            consumer,
            source,
            batch_size,
        });
        self
    }

    /// Start every job. The handles finish once `token` is cancelled.
    pub fn spawn(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(7);

        let engine = self.engine.clone();
        handles.push(tokio::spawn(run_job(
            "matching-batch",
            self.intervals.matching_batch,
            token.clone(),
            move || {
                let engine = engine.clone();
                async move {
                    let report = engine.run_batch().await?;
                    Ok(if report.skipped {
                        Cycle::Skipped
                    } else {
                        Cycle::Done(report.matched as u64)
                    })
                }
            },
        )));

        let engine = self.engine.clone();
        handles.push(tokio::spawn(run_job(
            "call-expiry",
            self.intervals.call_expiry,
            token.clone(),
            move || {
                let engine = engine.clone();
                async move { Ok(Cycle::Done(engine.expire_offers().await? as u64)) }
            },
        )));

        let engine = self.engine.clone();
        handles.push(tokio::spawn(run_job(
            "matching-timeout",
            self.intervals.matching_timeout,
            token.clone(),
            move || {
                let engine = engine.clone();
                async move { Ok(Cycle::Done(engine.sweep_timeouts().await? as u64)) }
            },
        )));

        let engine = self.engine.clone();
        handles.push(tokio::spawn(run_job(
            "matching-retry",
            self.intervals.matching_retry,
            token.clone(),
            move || {
                let engine = engine.clone();
                async move { Ok(Cycle::Done(engine.retry_failed_requests().await? as u64)) }
            },
        )));

        let surge = self.surge.clone();
        handles.push(tokio::spawn(run_job(
            "surge-refresh",
            self.intervals.surge_refresh,
            token.clone(),
            move || {
                let surge = surge.clone();
                async move { Ok(Cycle::Done(surge.refresh().await?.len() as u64)) }
            },
        )));

        let engine = self.engine.clone();
        handles.push(tokio::spawn(run_job(
            "request-retention",
            self.intervals.retention,
            token.clone(),
            move || {
                let engine = engine.clone();
                async move { Ok(Cycle::Done(engine.purge_expired_requests().await?)) }
            },
        )));

        if let Some(job) = &self.dead_letters {
            let consumer = job.consumer.clone();
            let source = job.source.clone();
            let batch_size = job.batch_size;
            handles.push(tokio::spawn(run_job(
                "dead-letter",
                self.intervals.dead_letter_poll,
                token,
                move || {
                    let consumer = consumer.clone();
                    let source = source.clone();
                    async move { Ok(Cycle::Done(consumer.drain(source.as_ref(), batch_size).await?)) }
                },
            )));
        }

        handles
    }
}

/// Run `cycle` every `period` until `token` is cancelled
pub async fn run_job<F, Fut>(name: &'static str, period: Duration, token: CancellationToken, mut cycle: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Cycle>> + Send,
{
    let metrics = JobMetrics::new(name);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(job = name, period_ms = period.as_millis() as u64, "Job started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut guard = JobRunGuard::new(&metrics);
        match cycle().await {
            Ok(Cycle::Done(items)) => {
                guard.complete(items);
                if items > 0 {
                    debug!(job = name, items, "Job cycle finished");
                }
            }
            Ok(Cycle::Skipped) => guard.skip(),
            Err(e) => warn!(job = name, error = %e, "Job cycle failed"),
        }
    }

    info!(job = name, "Job stopped");
}
