//! HTTP API for ride intake, driver actions, surge queries and dead-letter
//! administration

pub mod handlers;
pub mod models;
pub mod routes;

pub use handlers::DispatchApiState;
pub use routes::create_router;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::{DeadLetterConsumer, InMemoryQuarantineStore};
    use crate::store::DriverCallStore;
    use crate::testing::{self, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(h: &Harness) -> Router {
        let dead_letters = Arc::new(DeadLetterConsumer::new(
            h.config.dead_letter.clone(),
            h.bus.clone(),
            Arc::new(InMemoryQuarantineStore::new()),
            h.clock.clone(),
            h.metrics.clone(),
        ));
        create_router(Arc::new(DispatchApiState {
            service_name: "ride-dispatch".to_string(),
            service: h.service.clone(),
            dead_letters,
            metrics: h.metrics.clone(),
        }))
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn ride_body() -> Value {
        json!({
            "passenger_id": uuid::Uuid::new_v4(),
            "pickup": { "latitude": 37.7749, "longitude": -122.4194 },
            "dropoff": { "latitude": 37.8049, "longitude": -122.4194, "address": "North Beach" },
            "vehicle_type": "standard"
        })
    }

    #[tokio::test]
    async fn test_create_and_fetch_ride() {
        let h = testing::harness();
        let app = router(&h);

        let (status, body) = call(&app, "POST", "/api/v1/rides", Some(ride_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "REQUESTED");
        let ride_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "GET", &format!("/api/v1/rides/{}", ride_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ride"]["id"], ride_id.as_str());
        assert_eq!(body["data"]["matching_request"]["status"], "PENDING");
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let h = testing::harness();
        let app = router(&h);

        let (status, body) = call(&app, "GET", &format!("/api/v1/rides/{}", uuid::Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "RIDE_NOT_FOUND");

        let mut bad = ride_body();
        bad["pickup"]["latitude"] = json!(123.0);
        let (status, body) = call(&app, "POST", "/api/v1/rides", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION");

        let (status, _) = call(&app, "GET", "/api/v1/surge/nowhere", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_expired_offer_is_gone() {
        let h = testing::harness();
        let app = router(&h);
        let pickup = testing::pickup();
        let driver = testing::nearby_driver(&pickup, 400.0, 4.8, 0.9);
        h.location.upsert(driver.clone());

        let (_, body) = call(&app, "POST", "/api/v1/rides", Some(ride_body())).await;
        let ride_id: uuid::Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();
        h.engine.run_batch().await.unwrap();
        let calls = h.store.calls_for_ride(ride_id).await.unwrap();

        h.clock.advance(chrono::Duration::seconds(30));
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/driver-calls/{}/accept", calls[0].id),
            Some(json!({ "driver_id": driver.driver_id })),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["error"]["code"], "DRIVER_CALL_EXPIRED");
        assert_eq!(body["error"]["message"], "Offer no longer available");
    }

    #[tokio::test]
    async fn test_poison_message_is_quarantined_and_listed() {
        let h = testing::harness();
        let app = router(&h);
        let record = json!({
            "originalTopic": "ride-requested",
            "key": "ride-1",
            "payload": { "broken": true },
            "errorClass": "SERIALIZATION",
            "errorMessage": "unexpected token",
            "retryCount": 0,
            "failedAt": "2024-03-01T08:00:00Z"
        });

        let mut last = Value::Null;
        for _ in 0..h.config.dead_letter.poison_threshold {
            let (status, body) = call(&app, "POST", "/api/v1/dead-letters", Some(record.clone())).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
        }
        assert_eq!(last["data"]["disposition"], "quarantined");

        let (_, body) = call(&app, "GET", "/api/v1/dead-letters/quarantine", None).await;
        let entries = body["data"].as_array().unwrap();
        assert_eq!(entries.len(), 1);

        let entry_id = entries[0]["id"].as_str().unwrap();
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/dead-letters/quarantine/{}/release", entry_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["released"], true);
    }
}
