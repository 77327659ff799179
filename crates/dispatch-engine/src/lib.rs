//! Ride dispatch and matching engine
//!
//! This crate turns ride requests into driver assignments.
//!
//! # Features
//!
//! - Ride lifecycle with an audited state machine
//! - Batch matching with a cluster-wide batch lock
//! - Time-bounded driver offers, first acceptance wins
//! - Surge pricing from demand/supply samples
//! - Event publishing and dead-letter containment
//!
//! # Feature Flags
//!
//! - `postgres` - Enable PostgreSQL storage
//! - `api` - Enable HTTP API
//! - `client` - Enable HTTP clients for the location and profile services

pub mod clients;
pub mod dead_letter;
pub mod dispatcher;
pub mod domain;
pub mod driver_call;
pub mod engine;
pub mod error;
pub mod event;
pub mod fare;
pub mod lock;
pub mod metrics;
pub mod publisher;
pub mod redis_conn;
pub mod scoring;
pub mod state_machine;
pub mod store;
pub mod surge;
pub mod worker;

#[cfg(feature = "api")]
pub mod api;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use dispatcher::{DispatchService, RideDetails, RideRequest};
pub use domain::{
    CancelledBy, DriverCall, DriverCallStatus, MatchingRequest, MatchingStatus, Ride, RideStatus,
    SurgePrice,
};
pub use driver_call::{Acceptance, CallOffer, DriverCallService};
pub use engine::{BatchReport, MatchingEngine, RetryOutcome};
pub use error::{DispatchError, ErrorCategory, Result};
pub use event::{DispatchEvent, EventEnvelope};
pub use fare::FareEstimator;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use surge::{calculate_surge_multiplier, SurgePriceService};
pub use worker::{DispatchWorker, WorkerIntervals};

// Store exports
pub use store::traits::{DriverCallStore, MatchingRequestStore, RideStore, SurgePriceStore};
pub use store::InMemoryDispatchStore;

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresDispatchStore;

// Infrastructure exports
pub use dead_letter::{
    DeadLetterConsumer, DeadLetterRecord, DeadLetterSource, Disposition, InMemoryQuarantineStore,
    RedisStreamDeadLetterSource,
};
pub use lock::{BatchLock, InMemoryBatchLock, RedisBatchLock};
pub use publisher::{EventBus, EventPublisher, InMemoryEventPublisher, LogEventPublisher, RedisStreamPublisher};

// Client exports
pub use clients::location::{LocationClient, NearbyDriver, StaticLocationClient};
pub use clients::profile::{ProfileClient, StaticProfileClient};

#[cfg(feature = "client")]
pub use clients::location::http::HttpLocationClient;

#[cfg(feature = "client")]
pub use clients::profile::http::HttpProfileClient;
