//! Observability infrastructure for the ride dispatch service
//!
//! This crate provides:
//! - Structured logging via tracing
//! - Prometheus metrics exporter
//! - Per-job metric helpers for the background workers
//!
//! # Quick Start
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! init_logging("ride-dispatch", LogFormat::Json)?;
//! observability::metrics::init_metrics(9090)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::{init_metrics, JobMetrics, JobRunGuard};
