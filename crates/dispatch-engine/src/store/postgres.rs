//! PostgreSQL dispatch store implementation
//!
//! Ride transactions lock the ride row with `SELECT ... FOR UPDATE` and check
//! the optimistic version on write. Claiming pending matching requests uses
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers never share a request.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DriverId, Location, PassengerId, VehicleType};
use config::PostgresConfig;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::dead_letter::{DeadLetterRecord, QuarantineEntry, QuarantineStore};
use crate::domain::{
    CancelledBy, DriverCall, DriverCallStatus, MatchingRequest, MatchingStatus, Ride,
    RideStateTransition, RideStatus, RideTrigger, SurgePrice,
};
use crate::store::traits::{
    DriverCallStore, MatchingRequestStore, RideStore, RideTransaction, StoreError, StoreResult,
    SurgePriceStore,
};

const SCHEMA: &str = include_str!("../../../../migrations/0001_dispatch.sql");

const RIDE_COLUMNS: &str = "id, passenger_id, pickup, dropoff, fare, driver_id, status, vehicle_type, \
    payment_method_id, requested_at, matched_at, pickup_at, started_at, completed_at, cancelled_at, \
    cancellation_reason, cancelled_by, distance_meters, duration_seconds, driver_rating, \
    passenger_rating, version";

const CALL_COLUMNS: &str = "id, ride_id, driver_id, sequence_number, offered_at, expires_at, \
    estimated_arrival_seconds, estimated_fare, distance_to_pickup_meters, driver_location, status, \
    responded_at";

const REQUEST_COLUMNS: &str = "id, ride_id, passenger_id, pickup_cell, dropoff_cell, surge_multiplier, \
    expires_at, status, requested_at, processing_started_at, processed_at, batch_id, retry_count, \
    error_message, last_no_driver_at";

const SURGE_COLUMNS: &str =
    "id, geo_cell, surge_multiplier, demand_count, supply_count, effective_from, effective_to";

const QUARANTINE_COLUMNS: &str = "id, record, reason, quarantined_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// PostgreSQL store implementing every repository trait
#[derive(Clone)]
pub struct PostgresDispatchStore {
    pool: Arc<PgPool>,
}

impl PostgresDispatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a connection pool from configuration
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.connection_url())
            .await?;

        tracing::info!(
            host = %config.host,
            database = %config.database,
            "Connected to PostgreSQL"
        );
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&*self.pool).await?;
        Ok(())
    }
}

// ==================== Row Mapping ====================

fn parse_field<T>(value: &str, parse: impl Fn(&str) -> Option<T>, what: &str) -> StoreResult<T> {
    parse(value).ok_or_else(|| StoreError::Serialization(format!("unknown {} '{}'", what, value)))
}

fn ride_from_row(row: &PgRow, transitions: Vec<RideStateTransition>) -> StoreResult<Ride> {
    let status: String = row.try_get("status")?;
    let vehicle_type: String = row.try_get("vehicle_type")?;
    let cancelled_by: Option<String> = row.try_get("cancelled_by")?;

    Ok(Ride {
        id: row.try_get("id")?,
        passenger_id: PassengerId::from_uuid(row.try_get("passenger_id")?),
        pickup: row.try_get::<Json<Location>, _>("pickup")?.0,
        dropoff: row.try_get::<Json<Location>, _>("dropoff")?.0,
        fare: row.try_get::<Json<common::Fare>, _>("fare")?.0,
        driver_id: row.try_get::<Option<Uuid>, _>("driver_id")?.map(DriverId::from_uuid),
        status: parse_field(&status, RideStatus::parse, "ride status")?,
        vehicle_type: parse_field(&vehicle_type, VehicleType::parse, "vehicle type")?,
        payment_method_id: row.try_get("payment_method_id")?,
        requested_at: row.try_get("requested_at")?,
        matched_at: row.try_get("matched_at")?,
        pickup_at: row.try_get("pickup_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        cancelled_by: cancelled_by
            .map(|s| parse_field(&s, CancelledBy::parse, "cancellation actor"))
            .transpose()?,
        distance_meters: row.try_get("distance_meters")?,
        duration_seconds: row
            .try_get::<Option<i64>, _>("duration_seconds")?
            .map(|v| v as u64),
        driver_rating: row.try_get::<Option<i16>, _>("driver_rating")?.map(|v| v as u8),
        passenger_rating: row
            .try_get::<Option<i16>, _>("passenger_rating")?
            .map(|v| v as u8),
        version: row.try_get("version")?,
        transitions,
    })
}

fn transition_from_row(row: &PgRow) -> StoreResult<RideStateTransition> {
    let from_status: Option<String> = row.try_get("from_status")?;
    let to_status: String = row.try_get("to_status")?;
    let trigger: String = row.try_get("trigger")?;

    Ok(RideStateTransition {
        id: row.try_get("id")?,
        ride_id: row.try_get("ride_id")?,
        from_status: from_status
            .map(|s| parse_field(&s, RideStatus::parse, "ride status"))
            .transpose()?,
        to_status: parse_field(&to_status, RideStatus::parse, "ride status")?,
        trigger: parse_field(&trigger, RideTrigger::parse, "ride trigger")?,
        metadata: row.try_get::<Json<BTreeMap<String, String>>, _>("metadata")?.0,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn call_from_row(row: &PgRow) -> StoreResult<DriverCall> {
    let status: String = row.try_get("status")?;

    Ok(DriverCall {
        id: row.try_get("id")?,
        ride_id: row.try_get("ride_id")?,
        driver_id: DriverId::from_uuid(row.try_get("driver_id")?),
        sequence_number: row.try_get::<i32, _>("sequence_number")? as u32,
        offered_at: row.try_get("offered_at")?,
        expires_at: row.try_get("expires_at")?,
        estimated_arrival_seconds: row
            .try_get::<Option<i32>, _>("estimated_arrival_seconds")?
            .map(|v| v as u32),
        estimated_fare: row.try_get("estimated_fare")?,
        distance_to_pickup_meters: row.try_get("distance_to_pickup_meters")?,
        driver_location: row.try_get::<Json<Location>, _>("driver_location")?.0,
        status: parse_field(&status, DriverCallStatus::parse, "driver call status")?,
        responded_at: row.try_get("responded_at")?,
    })
}

fn request_from_row(row: &PgRow) -> StoreResult<MatchingRequest> {
    let status: String = row.try_get("status")?;

    Ok(MatchingRequest {
        id: row.try_get("id")?,
        ride_id: row.try_get("ride_id")?,
        passenger_id: PassengerId::from_uuid(row.try_get("passenger_id")?),
        pickup_cell: row.try_get("pickup_cell")?,
        dropoff_cell: row.try_get("dropoff_cell")?,
        surge_multiplier: row.try_get("surge_multiplier")?,
        expires_at: row.try_get("expires_at")?,
        status: parse_field(&status, MatchingStatus::parse, "matching status")?,
        requested_at: row.try_get("requested_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processed_at: row.try_get("processed_at")?,
        batch_id: row.try_get("batch_id")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        error_message: row.try_get("error_message")?,
        last_no_driver_at: row.try_get("last_no_driver_at")?,
    })
}

fn surge_from_row(row: &PgRow) -> StoreResult<SurgePrice> {
    Ok(SurgePrice {
        id: row.try_get("id")?,
        geo_cell: row.try_get("geo_cell")?,
        surge_multiplier: row.try_get("surge_multiplier")?,
        demand_count: row.try_get::<i64, _>("demand_count")? as u64,
        supply_count: row.try_get::<i64, _>("supply_count")? as u64,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
    })
}

// ==================== Shared Statements ====================

async fn load_transitions(conn: &mut PgConnection, ride_id: Uuid) -> StoreResult<Vec<RideStateTransition>> {
    let rows = sqlx::query(
        "SELECT id, ride_id, from_status, to_status, trigger, metadata, occurred_at \
         FROM ride_state_transitions WHERE ride_id = $1 ORDER BY position",
    )
    .bind(ride_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(transition_from_row).collect()
}

async fn load_ride(conn: &mut PgConnection, ride_id: Uuid, for_update: bool) -> StoreResult<Option<Ride>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!("SELECT {} FROM rides WHERE id = $1{}", RIDE_COLUMNS, lock))
        .bind(ride_id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let transitions = load_transitions(conn, ride_id).await?;
            Ok(Some(ride_from_row(&row, transitions)?))
        }
        None => Ok(None),
    }
}

/// Append transitions not yet stored; the audit trail is never updated
async fn insert_transitions(conn: &mut PgConnection, ride: &Ride) -> StoreResult<()> {
    for (position, transition) in ride.transitions.iter().enumerate() {
        sqlx::query(
            "INSERT INTO ride_state_transitions \
             (id, ride_id, position, from_status, to_status, trigger, metadata, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING",
        )
        .bind(transition.id)
        .bind(transition.ride_id)
        .bind(position as i32)
        .bind(transition.from_status.map(|s| s.as_str()))
        .bind(transition.to_status.as_str())
        .bind(transition.trigger.as_str())
        .bind(Json(&transition.metadata))
        .bind(transition.occurred_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_call(conn: &mut PgConnection, call: &DriverCall) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO driver_calls ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, responded_at = EXCLUDED.responded_at",
        CALL_COLUMNS
    ))
    .bind(call.id)
    .bind(call.ride_id)
    .bind(call.driver_id.0)
    .bind(call.sequence_number as i32)
    .bind(call.offered_at)
    .bind(call.expires_at)
    .bind(call.estimated_arrival_seconds.map(|v| v as i32))
    .bind(call.estimated_fare)
    .bind(call.distance_to_pickup_meters)
    .bind(Json(&call.driver_location))
    .bind(call.status.as_str())
    .bind(call.responded_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_request(conn: &mut PgConnection, request: &MatchingRequest) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO matching_requests ({}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (id) DO UPDATE SET \
            expires_at = EXCLUDED.expires_at, \
            status = EXCLUDED.status, \
            processing_started_at = EXCLUDED.processing_started_at, \
            processed_at = EXCLUDED.processed_at, \
            batch_id = EXCLUDED.batch_id, \
            retry_count = EXCLUDED.retry_count, \
            error_message = EXCLUDED.error_message, \
            last_no_driver_at = EXCLUDED.last_no_driver_at",
        REQUEST_COLUMNS
    ))
    .bind(request.id)
    .bind(request.ride_id)
    .bind(request.passenger_id.0)
    .bind(&request.pickup_cell)
    .bind(&request.dropoff_cell)
    .bind(request.surge_multiplier)
    .bind(request.expires_at)
    .bind(request.status.as_str())
    .bind(request.requested_at)
    .bind(request.processing_started_at)
    .bind(request.processed_at)
    .bind(request.batch_id)
    .bind(request.retry_count as i32)
    .bind(&request.error_message)
    .bind(request.last_no_driver_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ==================== Ride Transaction ====================

struct PostgresRideTransaction {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<Uuid>,
}

#[async_trait]
impl RideTransaction for PostgresRideTransaction {
    async fn lock_ride(&mut self, ride_id: Uuid) -> StoreResult<Option<Ride>> {
        let ride = load_ride(&mut self.tx, ride_id, true).await?;
        if ride.is_some() {
            self.locked.insert(ride_id);
        }
        Ok(ride)
    }

    async fn save_ride(&mut self, ride: &mut Ride) -> StoreResult<()> {
        if !self.locked.contains(&ride.id) {
            return Err(StoreError::Other(format!("ride {} was not locked", ride.id)));
        }

        let result = sqlx::query(
            "UPDATE rides SET \
                fare = $3, driver_id = $4, status = $5, matched_at = $6, pickup_at = $7, \
                started_at = $8, completed_at = $9, cancelled_at = $10, cancellation_reason = $11, \
                cancelled_by = $12, distance_meters = $13, duration_seconds = $14, \
                driver_rating = $15, passenger_rating = $16, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(ride.id)
        .bind(ride.version)
        .bind(Json(&ride.fare))
        .bind(ride.driver_id.map(|d| d.0))
        .bind(ride.status.as_str())
        .bind(ride.matched_at)
        .bind(ride.pickup_at)
        .bind(ride.started_at)
        .bind(ride.completed_at)
        .bind(ride.cancelled_at)
        .bind(&ride.cancellation_reason)
        .bind(ride.cancelled_by.map(|c| c.as_str()))
        .bind(ride.distance_meters)
        .bind(ride.duration_seconds.map(|v| v as i64))
        .bind(ride.driver_rating.map(i16::from))
        .bind(ride.passenger_rating.map(i16::from))
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                ride_id: ride.id,
                expected: ride.version,
            });
        }

        insert_transitions(&mut self.tx, ride).await?;
        ride.version += 1;
        Ok(())
    }

    async fn get_call(&mut self, call_id: Uuid) -> StoreResult<Option<DriverCall>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM driver_calls WHERE id = $1 FOR UPDATE",
            CALL_COLUMNS
        ))
        .bind(call_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(call_from_row).transpose()
    }

    async fn calls_for_ride(&mut self, ride_id: Uuid) -> StoreResult<Vec<DriverCall>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM driver_calls WHERE ride_id = $1 \
             ORDER BY offered_at, sequence_number FOR UPDATE",
            CALL_COLUMNS
        ))
        .bind(ride_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(call_from_row).collect()
    }

    async fn save_calls(&mut self, calls: &[DriverCall]) -> StoreResult<()> {
        for call in calls {
            upsert_call(&mut self.tx, call).await?;
        }
        Ok(())
    }

    async fn latest_request_for_ride(&mut self, ride_id: Uuid) -> StoreResult<Option<MatchingRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM matching_requests WHERE ride_id = $1 \
             ORDER BY requested_at DESC, retry_count DESC LIMIT 1 FOR UPDATE",
            REQUEST_COLUMNS
        ))
        .bind(ride_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn save_request(&mut self, request: &MatchingRequest) -> StoreResult<()> {
        upsert_request(&mut self.tx, request).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ==================== Repository Traits ====================

#[async_trait]
impl RideStore for PostgresDispatchStore {
    async fn insert_ride(&self, ride: &Ride, request: &MatchingRequest) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO rides ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)",
            RIDE_COLUMNS
        ))
        .bind(ride.id)
        .bind(ride.passenger_id.0)
        .bind(Json(&ride.pickup))
        .bind(Json(&ride.dropoff))
        .bind(Json(&ride.fare))
        .bind(ride.driver_id.map(|d| d.0))
        .bind(ride.status.as_str())
        .bind(ride.vehicle_type.as_str())
        .bind(&ride.payment_method_id)
        .bind(ride.requested_at)
        .bind(ride.matched_at)
        .bind(ride.pickup_at)
        .bind(ride.started_at)
        .bind(ride.completed_at)
        .bind(ride.cancelled_at)
        .bind(&ride.cancellation_reason)
        .bind(ride.cancelled_by.map(|c| c.as_str()))
        .bind(ride.distance_meters)
        .bind(ride.duration_seconds.map(|v| v as i64))
        .bind(ride.driver_rating.map(i16::from))
        .bind(ride.passenger_rating.map(i16::from))
        .bind(ride.version)
        .execute(&mut *tx)
        .await?;

        insert_transitions(&mut tx, ride).await?;
        upsert_request(&mut tx, request).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_ride(&self, ride_id: Uuid) -> StoreResult<Option<Ride>> {
        let mut conn = self.pool.acquire().await?;
        load_ride(&mut conn, ride_id, false).await
    }

    async fn active_ride_for_passenger(&self, passenger_id: PassengerId) -> StoreResult<Option<Ride>> {
        let mut conn = self.pool.acquire().await?;
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM rides WHERE passenger_id = $1 \
             AND status NOT IN ('COMPLETED', 'CANCELLED', 'FAILED') LIMIT 1",
        )
        .bind(passenger_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        match id {
            Some(id) => load_ride(&mut conn, id, false).await,
            None => Ok(None),
        }
    }

    async fn rides_requested_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM rides WHERE status = 'REQUESTED' AND requested_at < $1 \
             ORDER BY requested_at, id LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;
        Ok(ids)
    }

    async fn begin(&self) -> StoreResult<Box<dyn RideTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresRideTransaction {
            tx,
            locked: HashSet::new(),
        }))
    }
}

#[async_trait]
impl DriverCallStore for PostgresDispatchStore {
    async fn get_call(&self, call_id: Uuid) -> StoreResult<Option<DriverCall>> {
        let row = sqlx::query(&format!("SELECT {} FROM driver_calls WHERE id = $1", CALL_COLUMNS))
            .bind(call_id)
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(call_from_row).transpose()
    }

    async fn calls_for_ride(&self, ride_id: Uuid) -> StoreResult<Vec<DriverCall>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM driver_calls WHERE ride_id = $1 ORDER BY offered_at, sequence_number",
            CALL_COLUMNS
        ))
        .bind(ride_id)
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(call_from_row).collect()
    }

    async fn pending_calls_for_driver(&self, driver_id: DriverId) -> StoreResult<Vec<DriverCall>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM driver_calls WHERE driver_id = $1 AND status = 'PENDING' \
             ORDER BY offered_at, sequence_number",
            CALL_COLUMNS
        ))
        .bind(driver_id.0)
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(call_from_row).collect()
    }

    async fn drivers_with_pending_calls(&self, drivers: &[DriverId]) -> StoreResult<HashSet<DriverId>> {
        if drivers.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<Uuid> = drivers.iter().map(|d| d.0).collect();
        let busy: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT driver_id FROM driver_calls \
             WHERE status = 'PENDING' AND driver_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await?;
        Ok(busy.into_iter().map(DriverId::from_uuid).collect())
    }

    async fn expire_calls(&self, now: DateTime<Utc>) -> StoreResult<Vec<DriverCall>> {
        let rows = sqlx::query(&format!(
            "UPDATE driver_calls SET status = 'EXPIRED', responded_at = $1 \
             WHERE status = 'PENDING' AND expires_at < $1 RETURNING {}",
            CALL_COLUMNS
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await?;

        let mut calls: Vec<DriverCall> = rows.iter().map(call_from_row).collect::<StoreResult<_>>()?;
        calls.sort_by(|a, b| {
            a.offered_at
                .cmp(&b.offered_at)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });
        Ok(calls)
    }

    async fn acceptance_stats(&self, driver_id: DriverId, since: DateTime<Utc>) -> StoreResult<(u64, u64)> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE status IN ('ACCEPTED', 'REJECTED', 'EXPIRED')) AS answered, \
                COUNT(*) FILTER (WHERE status = 'ACCEPTED') AS accepted \
             FROM driver_calls WHERE driver_id = $1 AND offered_at >= $2",
        )
        .bind(driver_id.0)
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;

        let answered: i64 = row.try_get("answered")?;
        let accepted: i64 = row.try_get("accepted")?;
        Ok((answered as u64, accepted as u64))
    }
}

#[async_trait]
impl MatchingRequestStore for PostgresDispatchStore {
    async fn get_request(&self, request_id: Uuid) -> StoreResult<Option<MatchingRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM matching_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn latest_request_for_ride(&self, ride_id: Uuid) -> StoreResult<Option<MatchingRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM matching_requests WHERE ride_id = $1 \
             ORDER BY requested_at DESC, retry_count DESC LIMIT 1",
            REQUEST_COLUMNS
        ))
        .bind(ride_id)
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn claim_pending(
        &self,
        limit: u32,
        older_than: DateTime<Utc>,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchingRequest>> {
        let rows = sqlx::query(&format!(
            "UPDATE matching_requests SET status = 'PROCESSING', batch_id = $1, processing_started_at = $2 \
             WHERE id IN ( \
                SELECT id FROM matching_requests \
                WHERE status = 'PENDING' AND requested_at <= $3 \
                ORDER BY requested_at, id LIMIT $4 \
                FOR UPDATE SKIP LOCKED \
             ) RETURNING {}",
            REQUEST_COLUMNS
        ))
        .bind(batch_id)
        .bind(now)
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;

        let mut claimed: Vec<MatchingRequest> =
            rows.iter().map(request_from_row).collect::<StoreResult<_>>()?;
        claimed.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn save_request(&self, request: &MatchingRequest, expected: MatchingStatus) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE matching_requests SET \
                expires_at = $3, status = $4, processing_started_at = $5, processed_at = $6, \
                batch_id = $7, retry_count = $8, error_message = $9, last_no_driver_at = $10 \
             WHERE id = $1 AND status = $2",
        )
        .bind(request.id)
        .bind(expected.as_str())
        .bind(request.expires_at)
        .bind(request.status.as_str())
        .bind(request.processing_started_at)
        .bind(request.processed_at)
        .bind(request.batch_id)
        .bind(request.retry_count as i32)
        .bind(&request.error_message)
        .bind(request.last_no_driver_at)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<MatchingRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM matching_requests \
             WHERE status IN ('PENDING', 'PROCESSING') AND expires_at < $1 \
             ORDER BY expires_at, id LIMIT $2",
            REQUEST_COLUMNS
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn find_retryable(
        &self,
        max_retry_count: u32,
        failed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<MatchingRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM matching_requests \
             WHERE status = 'FAILED' AND retry_count < $1 AND processed_at <= $2 AND expires_at > $3 \
             ORDER BY requested_at, id LIMIT $4",
            REQUEST_COLUMNS
        ))
        .bind(max_retry_count as i32)
        .bind(failed_before)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM matching_requests \
             WHERE status IN ('COMPLETED', 'FAILED') AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn demand_by_cell(&self, since: DateTime<Utc>) -> StoreResult<HashMap<String, u64>> {
        let rows = sqlx::query(
            "SELECT pickup_cell, COUNT(DISTINCT ride_id) AS demand \
             FROM matching_requests WHERE requested_at >= $1 GROUP BY pickup_cell",
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        let mut demand = HashMap::with_capacity(rows.len());
        for row in rows {
            let cell: String = row.try_get("pickup_cell")?;
            let count: i64 = row.try_get("demand")?;
            demand.insert(cell, count as u64);
        }
        Ok(demand)
    }
}

#[async_trait]
impl SurgePriceStore for PostgresDispatchStore {
    async fn current(&self, geo_cell: &str, now: DateTime<Utc>) -> StoreResult<Option<SurgePrice>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM surge_prices \
             WHERE geo_cell = $1 AND effective_from <= $2 AND (effective_to IS NULL OR effective_to > $2) \
             ORDER BY effective_from DESC LIMIT 1",
            SURGE_COLUMNS
        ))
        .bind(geo_cell)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(surge_from_row).transpose()
    }

    async fn replace_active(&self, surge: &SurgePrice, now: DateTime<Utc>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE surge_prices SET effective_to = $2 WHERE geo_cell = $1 AND effective_to IS NULL",
        )
        .bind(&surge.geo_cell)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO surge_prices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            SURGE_COLUMNS
        ))
        .bind(surge.id)
        .bind(&surge.geo_cell)
        .bind(surge.surge_multiplier)
        .bind(surge.demand_count as i64)
        .bind(surge.supply_count as i64)
        .bind(surge.effective_from)
        .bind(surge.effective_to)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, geo_cell: &str, limit: u32) -> StoreResult<Vec<SurgePrice>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM surge_prices WHERE geo_cell = $1 ORDER BY effective_from DESC LIMIT $2",
            SURGE_COLUMNS
        ))
        .bind(geo_cell)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(surge_from_row).collect()
    }
}

// ==================== Quarantine ====================

fn quarantine_from_row(row: &PgRow) -> StoreResult<QuarantineEntry> {
    Ok(QuarantineEntry {
        id: row.try_get("id")?,
        record: row.try_get::<Json<DeadLetterRecord>, _>("record")?.0,
        reason: row.try_get("reason")?,
        quarantined_at: row.try_get("quarantined_at")?,
    })
}

#[async_trait]
impl QuarantineStore for PostgresDispatchStore {
    async fn quarantine(&self, entry: QuarantineEntry) -> crate::error::Result<()> {
        sqlx::query(
            "INSERT INTO quarantined_messages (id, original_topic, message_key, record, reason, quarantined_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.id)
        .bind(&entry.record.original_topic)
        .bind(&entry.record.key)
        .bind(Json(&entry.record))
        .bind(&entry.reason)
        .bind(entry.quarantined_at)
        .execute(&*self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list(&self) -> crate::error::Result<Vec<QuarantineEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM quarantined_messages ORDER BY quarantined_at, id",
            QUARANTINE_COLUMNS
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows.iter().map(quarantine_from_row).collect::<StoreResult<Vec<_>>>()?)
    }

    async fn take(&self, id: Uuid) -> crate::error::Result<Option<QuarantineEntry>> {
        let row = sqlx::query(&format!(
            "DELETE FROM quarantined_messages WHERE id = $1 RETURNING {}",
            QUARANTINE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.as_ref().map(quarantine_from_row).transpose()?)
    }

    async fn is_quarantined(&self, topic: &str, key: &str) -> crate::error::Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM quarantined_messages WHERE original_topic = $1 AND message_key = $2)",
        )
        .bind(topic)
        .bind(key)
        .fetch_one(&*self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::topics;

    fn entry(key: &str, at: DateTime<Utc>) -> QuarantineEntry {
        QuarantineEntry {
            id: Uuid::new_v4(),
            record: DeadLetterRecord {
                original_topic: topics::RIDE_MATCHED.to_string(),
                key: key.to_string(),
                payload: serde_json::json!({"type": "ride_matched"}),
                error_class: "SERIALIZATION".to_string(),
                error_message: "bad payload".to_string(),
                retry_count: 0,
                failed_at: at,
            },
            reason: "poison message".to_string(),
            quarantined_at: at,
        }
    }

    #[test]
    fn test_schema_creates_quarantine_table() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS quarantined_messages"));
        for column in QUARANTINE_COLUMNS.split(", ") {
            assert!(SCHEMA.contains(column), "missing column {}", column);
        }
    }

    #[tokio::test]
    #[ignore = "needs PostgreSQL at DISPATCH_TEST_DATABASE_URL"]
    async fn test_quarantine_store_round_trip() {
        let url = std::env::var("DISPATCH_TEST_DATABASE_URL").unwrap();
        let store = PostgresDispatchStore::new(PgPool::connect(&url).await.unwrap());
        store.ensure_schema().await.unwrap();

        let key = format!("ride-{}", Uuid::new_v4());
        let first = entry(&key, crate::testing::t0());
        store.quarantine(first.clone()).await.unwrap();

        assert!(store.is_quarantined(topics::RIDE_MATCHED, &key).await.unwrap());
        assert!(store.list().await.unwrap().iter().any(|e| e.id == first.id));

        let taken = store.take(first.id).await.unwrap().unwrap();
        assert_eq!(taken.record, first.record);
        assert!(store.take(first.id).await.unwrap().is_none());
        assert!(!store.is_quarantined(topics::RIDE_MATCHED, &key).await.unwrap());
    }
}
