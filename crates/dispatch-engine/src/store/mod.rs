//! Store module exports

pub mod memory;
pub mod traits;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryDispatchStore;
pub use traits::{
    DriverCallStore, MatchingRequestStore, RideStore, RideTransaction, StoreError, StoreResult,
    SurgePriceStore,
};
