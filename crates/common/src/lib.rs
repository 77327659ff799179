//! Common types and utilities for the ride dispatch service
//!
//! This crate provides the value objects and primitives shared by the
//! dispatch engine, configuration and binaries.
//!
//! # Modules
//!
//! - [`error`] - Common error types
//! - [`types`] - Shared domain types (DriverId, Location, Fare, etc.)
//! - [`geo`] - Haversine distance and H3 geo-cell helpers
//! - [`clock`] - Wall-clock abstraction used for every time comparison

pub mod clock;
pub mod error;
pub mod geo;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::*;
