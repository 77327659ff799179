//! Event publishing
//!
//! Services hand events to the [`EventBus`] after their state change has been
//! committed. A failed publish is logged and counted; it never undoes the
//! mutation that produced the event.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::Clock;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::event::{DispatchEvent, EventEnvelope};
use crate::metrics::EngineMetrics;

#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Message-queue producer capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

// ==================== In-Memory Publisher ====================

/// Records envelopes in publish order. Topics can be switched to failing.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    published: RwLock<Vec<EventEnvelope>>,
    failing_topics: RwLock<HashSet<String>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish to `topic` fail
    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.write().insert(topic.to_string());
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published.read().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<EventEnvelope> {
        self.published
            .read()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        if self.failing_topics.read().contains(&envelope.topic) {
            return Err(PublishError::Transport(format!(
                "topic {} is unavailable",
                envelope.topic
            )));
        }
        self.published.write().push(envelope.clone());
        Ok(())
    }
}

// ==================== Log Publisher ====================

/// Writes every event to the log; for local runs without a broker
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        info!(
            topic = %envelope.topic,
            key = %envelope.key,
            event_id = %envelope.id,
            payload = %envelope.payload,
            "Event"
        );
        Ok(())
    }
}

// ==================== Redis Streams Publisher ====================

/// Appends each envelope to a Redis stream named after its topic
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: redis::aio::ConnectionManager,
    max_len: usize,
}

impl RedisStreamPublisher {
    pub fn new(conn: redis::aio::ConnectionManager, max_len: usize) -> Self {
        Self { conn, max_len }
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let body =
            serde_json::to_string(envelope).map_err(|e| PublishError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&envelope.topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("key")
            .arg(&envelope.key)
            .arg("payload")
            .arg(body)
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        debug!(topic = %envelope.topic, key = %envelope.key, entry_id = %entry_id, "Appended to stream");
        Ok(())
    }
}

// ==================== Event Bus ====================

pub struct EventBus {
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
}

impl EventBus {
    pub fn new(publisher: Arc<dyn EventPublisher>, clock: Arc<dyn Clock>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            publisher,
            clock,
            metrics,
        }
    }

    /// Failures are logged with topic and key and counted in
    /// `publish_failures`; callers do not see them
    pub async fn publish(&self, event: DispatchEvent) {
        let topic = event.topic();
        let key = event.ride_id().to_string();

        let envelope = match EventEnvelope::from_event(&event, self.clock.now()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.publish_failures.increment();
                error!(topic = %topic, key = %key, error = %e, "Failed to encode event");
                return;
            }
        };

        match self.publisher.publish(&envelope).await {
            Ok(()) => {
                self.metrics.events_published.increment();
                debug!(topic = %topic, key = %key, "Published event");
            }
            Err(e) => {
                self.metrics.publish_failures.increment();
                error!(topic = %topic, key = %key, error = %e, "Failed to publish event");
            }
        }
    }

    /// Publish in order; a failure does not stop the remaining events
    pub async fn publish_all(&self, events: impl IntoIterator<Item = DispatchEvent> + Send) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Send an already encoded envelope again, e.g. a dead-letter redelivery
    pub async fn republish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        match self.publisher.publish(envelope).await {
            Ok(()) => {
                self.metrics.events_published.increment();
                Ok(())
            }
            Err(e) => {
                self.metrics.publish_failures.increment();
                error!(
                    topic = %envelope.topic,
                    key = %envelope.key,
                    attempt = envelope.attempt,
                    error = %e,
                    "Failed to republish event"
                );
                Err(e)
            }
        }
    }
}
