//! Shared test fixtures

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::{geo, DriverId, Fare, Location, ManualClock, PassengerId, VehicleType};
use config::DispatchConfig;
use uuid::Uuid;

use crate::clients::location::{LocationClient, NearbyDriver, StaticLocationClient};
use crate::clients::profile::StaticProfileClient;
use crate::dispatcher::DispatchService;
use crate::domain::{DriverCall, NewRide, Ride};
use crate::driver_call::DriverCallService;
use crate::engine::MatchingEngine;
use crate::fare::FareEstimator;
use crate::lock::InMemoryBatchLock;
use crate::metrics::EngineMetrics;
use crate::publisher::{EventBus, InMemoryEventPublisher};
use crate::store::InMemoryDispatchStore;
use crate::surge::SurgePriceService;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn pickup() -> Location {
    Location::from_coordinates(37.7749, -122.4194, Some("Market St".to_string())).unwrap()
}

/// A point `meters` due north of `origin`
pub fn location_north_of(origin: &Location, meters: f64) -> Location {
    let delta_degrees = (meters / (geo::EARTH_RADIUS_KM * 1000.0)).to_degrees();
    Location::from_coordinates(origin.latitude() + delta_degrees, origin.longitude(), None).unwrap()
}

/// A REQUESTED standard ride for a fresh passenger
pub fn ride(now: DateTime<Utc>) -> Ride {
    ride_at(pickup(), now)
}

pub fn ride_at(pickup: Location, now: DateTime<Utc>) -> Ride {
    let dropoff = location_north_of(&pickup, 3000.0);
    Ride::request(
        NewRide {
            passenger_id: PassengerId::new(),
            pickup,
            dropoff,
            fare: Fare::new(12.0, 1.0, "USD").unwrap(),
            vehicle_type: VehicleType::Standard,
            payment_method_id: Some("pm_test".to_string()),
        },
        now,
    )
}

/// PENDING call with a 20s offer window
pub fn driver_call(ride_id: Uuid, driver_id: DriverId, sequence_number: u32, now: DateTime<Utc>) -> DriverCall {
    DriverCall::offer(
        ride_id,
        driver_id,
        sequence_number,
        pickup(),
        now,
        now + chrono::Duration::seconds(20),
    )
}

pub fn nearby_driver(pickup: &Location, distance_meters: f64, rating: f64, acceptance_rate: f64) -> NearbyDriver {
    NearbyDriver {
        driver_id: DriverId::new(),
        location: location_north_of(pickup, distance_meters),
        rating,
        acceptance_rate,
        vehicle_type: VehicleType::Standard,
    }
}

/// Defaults with a search ring wide enough to reach drivers a few km out
pub fn config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.matching.search_ring = 12;
    config.matching.min_request_age_ms = 0;
    config
}

/// Fully wired in-memory services sharing one clock, store and event log
pub struct Harness {
    pub config: DispatchConfig,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryDispatchStore>,
    pub location: Arc<StaticLocationClient>,
    pub publisher: Arc<InMemoryEventPublisher>,
    pub metrics: Arc<EngineMetrics>,
    pub bus: Arc<EventBus>,
    pub lock: Arc<InMemoryBatchLock>,
    pub calls: Arc<DriverCallService>,
    pub surge: Arc<SurgePriceService>,
    pub fares: Arc<FareEstimator>,
    pub engine: Arc<MatchingEngine>,
    pub profiles: Arc<StaticProfileClient>,
    pub service: Arc<DispatchService>,
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: DispatchConfig) -> Harness {
    let location = Arc::new(StaticLocationClient::new());
    harness_with_location(config, location.clone(), location)
}

/// Like [`harness_with`] but the engine and surge service query `lookup`
pub fn harness_with_location(
    config: DispatchConfig,
    location: Arc<StaticLocationClient>,
    lookup: Arc<dyn LocationClient>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(InMemoryDispatchStore::new());
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let metrics = Arc::new(EngineMetrics::new());
    let bus = Arc::new(EventBus::new(publisher.clone(), clock.clone(), metrics.clone()));
    let lock = Arc::new(InMemoryBatchLock::new(clock.clone()));
    let external_timeout = Duration::from_millis(config.matching.external_call_timeout_ms);

    let calls = Arc::new(DriverCallService::new(
        store.clone(),
        store.clone(),
        bus.clone(),
        config.driver_call.clone(),
        config.matching.max_retry_count,
        clock.clone(),
        metrics.clone(),
    ));
    let surge = Arc::new(SurgePriceService::new(
        store.clone(),
        store.clone(),
        lookup.clone(),
        config.surge.clone(),
        external_timeout,
        clock.clone(),
        metrics.clone(),
    ));
    let fares = Arc::new(FareEstimator::new(config.fares.clone()));
    let engine = Arc::new(MatchingEngine::new(
        config.matching.clone(),
        "test-instance".to_string(),
        store.clone(),
        store.clone(),
        lookup,
        lock.clone(),
        calls.clone(),
        fares.clone(),
        bus.clone(),
        clock.clone(),
        metrics.clone(),
    ));
    let profiles = Arc::new(StaticProfileClient::new());
    let service = Arc::new(DispatchService::new(
        store.clone(),
        store.clone(),
        calls.clone(),
        engine.clone(),
        surge.clone(),
        fares.clone(),
        profiles.clone(),
        bus.clone(),
        chrono::Duration::seconds(config.matching.request_ttl_seconds as i64),
        external_timeout,
        clock.clone(),
        metrics.clone(),
    ));

    Harness {
        config,
        clock,
        store,
        location,
        publisher,
        metrics,
        bus,
        lock,
        calls,
        surge,
        fares,
        engine,
        profiles,
        service,
    }
}
