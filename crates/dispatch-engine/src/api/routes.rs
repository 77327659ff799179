//! API routes for the dispatch service

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::handlers::*;

/// Create the dispatch router
pub fn create_router(state: Arc<DispatchApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics/snapshot", get(metrics_snapshot))
        .route("/api/v1/rides", post(create_ride))
        .route("/api/v1/rides/:ride_id", get(get_ride))
        .route("/api/v1/rides/:ride_id/cancel", post(cancel_ride))
        .route("/api/v1/rides/:ride_id/retry", post(retry_matching))
        .route("/api/v1/rides/:ride_id/en-route", post(driver_en_route))
        .route("/api/v1/rides/:ride_id/arrived", post(driver_arrived))
        .route("/api/v1/rides/:ride_id/start", post(start_trip))
        .route("/api/v1/rides/:ride_id/complete", post(complete_ride))
        .route("/api/v1/rides/:ride_id/rate-driver", post(rate_driver))
        .route("/api/v1/rides/:ride_id/rate-passenger", post(rate_passenger))
        .route("/api/v1/driver-calls/:call_id/accept", post(accept_call))
        .route("/api/v1/driver-calls/:call_id/reject", post(reject_call))
        .route("/api/v1/drivers/:driver_id/calls", get(driver_offers))
        .route("/api/v1/surge/:cell", get(get_surge))
        .route("/api/v1/surge/:cell/history", get(surge_history))
        .route("/api/v1/dead-letters", post(submit_dead_letter))
        .route("/api/v1/dead-letters/quarantine", get(list_quarantined))
        .route(
            "/api/v1/dead-letters/quarantine/:entry_id/release",
            post(release_quarantined),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
