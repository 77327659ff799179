//! API handlers for the dispatch HTTP endpoints

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use common::DriverId;
use uuid::Uuid;

use crate::api::models::*;
use crate::dead_letter::{DeadLetterConsumer, DeadLetterRecord, Disposition, QuarantineEntry};
use crate::dispatcher::{DispatchService, RideDetails, SurgeQuote};
use crate::domain::{DriverCall, Ride, SurgePrice};
use crate::driver_call::Acceptance;
use crate::error::{DispatchError, ErrorCategory};
use crate::metrics::{EngineMetrics, MetricsSnapshot};

pub struct DispatchApiState {
    pub service_name: String,
    pub service: Arc<DispatchService>,
    pub dead_letters: Arc<DeadLetterConsumer>,
    pub metrics: Arc<EngineMetrics>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// Map a dispatch error onto a status code and client-safe body
pub fn error_response(err: DispatchError) -> ApiError {
    let status = match err.category() {
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        ErrorCategory::RetryLater => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::OfferUnavailable => StatusCode::GONE,
        ErrorCategory::Invalid => StatusCode::BAD_REQUEST,
        ErrorCategory::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(code = err.code(), error = %err, "Request failed");
    }

    (
        status,
        Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: err.code().to_string(),
                message: err.user_message(),
            },
        }),
    )
}

fn respond<T>(result: crate::error::Result<T>) -> ApiResult<T> {
    result.map(|data| Json(ApiResponse::success(data))).map_err(error_response)
}

pub async fn health_handler(State(state): State<Arc<DispatchApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.service_name.clone(),
    })
}

pub async fn metrics_snapshot(State(state): State<Arc<DispatchApiState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub async fn create_ride(
    State(state): State<Arc<DispatchApiState>>,
    Json(req): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Ride>>), ApiError> {
    let request = req.into_ride_request().map_err(error_response)?;
    let ride = state.service.request_ride(request).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(ride))))
}

pub async fn get_ride(State(state): State<Arc<DispatchApiState>>, Path(ride_id): Path<Uuid>) -> ApiResult<RideDetails> {
    respond(state.service.get_ride_details(ride_id).await)
}

pub async fn cancel_ride(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<CancelRideRequest>,
) -> ApiResult<Ride> {
    respond(state.service.cancel_ride(ride_id, &req.reason, req.cancelled_by).await)
}

pub async fn retry_matching(State(state): State<Arc<DispatchApiState>>, Path(ride_id): Path<Uuid>) -> ApiResult<RetryResponse> {
    respond(state.service.retry_matching(ride_id).await.map(RetryResponse::from))
}

pub async fn driver_en_route(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<DriverActionRequest>,
) -> ApiResult<Ride> {
    respond(state.service.driver_en_route(ride_id, req.driver_id).await)
}

pub async fn driver_arrived(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<DriverActionRequest>,
) -> ApiResult<Ride> {
    respond(state.service.driver_arrived(ride_id, req.driver_id).await)
}

pub async fn start_trip(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<DriverActionRequest>,
) -> ApiResult<Ride> {
    respond(state.service.start_trip(ride_id, req.driver_id).await)
}

pub async fn complete_ride(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<CompleteRideRequest>,
) -> ApiResult<Ride> {
    respond(
        state
            .service
            .complete_ride(ride_id, req.driver_id, req.distance_meters, req.duration_seconds, req.total_fare)
            .await,
    )
}

pub async fn rate_driver(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<RatingRequest>,
) -> ApiResult<Ride> {
    respond(state.service.rate_driver(ride_id, req.rating).await)
}

pub async fn rate_passenger(
    State(state): State<Arc<DispatchApiState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<RatingRequest>,
) -> ApiResult<Ride> {
    respond(state.service.rate_passenger(ride_id, req.rating).await)
}

pub async fn accept_call(
    State(state): State<Arc<DispatchApiState>>,
    Path(call_id): Path<Uuid>,
    Json(req): Json<DriverActionRequest>,
) -> ApiResult<Acceptance> {
    respond(state.service.accept_call(call_id, req.driver_id).await)
}

pub async fn reject_call(
    State(state): State<Arc<DispatchApiState>>,
    Path(call_id): Path<Uuid>,
    Json(req): Json<DriverActionRequest>,
) -> ApiResult<DriverCall> {
    respond(state.service.reject_call(call_id, req.driver_id).await)
}

pub async fn driver_offers(
    State(state): State<Arc<DispatchApiState>>,
    Path(driver_id): Path<Uuid>,
) -> ApiResult<Vec<DriverCall>> {
    respond(state.service.driver_offers(DriverId::from_uuid(driver_id)).await)
}

pub async fn get_surge(State(state): State<Arc<DispatchApiState>>, Path(cell): Path<String>) -> ApiResult<SurgeQuote> {
    respond(state.service.surge_quote(&cell).await)
}

pub async fn surge_history(
    State(state): State<Arc<DispatchApiState>>,
    Path(cell): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<SurgePrice>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(500);
    respond(state.service.surge_history(&cell, limit).await)
}

pub async fn submit_dead_letter(
    State(state): State<Arc<DispatchApiState>>,
    Json(record): Json<DeadLetterRecord>,
) -> ApiResult<Disposition> {
    respond(state.dead_letters.handle(record).await)
}

pub async fn list_quarantined(State(state): State<Arc<DispatchApiState>>) -> ApiResult<Vec<QuarantineEntry>> {
    respond(state.dead_letters.quarantined().await)
}

pub async fn release_quarantined(
    State(state): State<Arc<DispatchApiState>>,
    Path(entry_id): Path<Uuid>,
) -> ApiResult<ReleaseResponse> {
    respond(
        state
            .dead_letters
            .release(entry_id)
            .await
            .map(|released| ReleaseResponse { released }),
    )
}
