//! Dead-letter handling with poison-message containment
//!
//! Consumers of the primary topics park messages they failed to process on
//! `<topic>-dlq`. This consumer decides per record whether to redeliver it,
//! quarantine it, or drop it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::Clock;
use config::DeadLetterConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::event::{topics, EventEnvelope};
use crate::metrics::EngineMetrics;
use crate::publisher::EventBus;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

/// A message as it arrives on a dead-letter topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub error_class: String,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// Sent back to the primary topic
    Redeliver { attempt: u32 },
    Quarantined { reason: String },
    Discarded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: Uuid,
    pub record: DeadLetterRecord,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

#[async_trait]
pub trait QuarantineStore: Send + Sync {
    async fn quarantine(&self, entry: QuarantineEntry) -> Result<()>;

    /// Oldest first
    async fn list(&self) -> Result<Vec<QuarantineEntry>>;

    /// Remove and return the entry
    async fn take(&self, id: Uuid) -> Result<Option<QuarantineEntry>>;

    async fn is_quarantined(&self, topic: &str, key: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryQuarantineStore {
    entries: RwLock<Vec<QuarantineEntry>>,
}

impl InMemoryQuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuarantineStore for InMemoryQuarantineStore {
    async fn quarantine(&self, entry: QuarantineEntry) -> Result<()> {
        self.entries.write().push(entry);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QuarantineEntry>> {
        Ok(self.entries.read().clone())
    }

    async fn take(&self, id: Uuid) -> Result<Option<QuarantineEntry>> {
        let mut entries = self.entries.write();
        Ok(entries
            .iter()
            .position(|e| e.id == id)
            .map(|idx| entries.remove(idx)))
    }

    async fn is_quarantined(&self, topic: &str, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .iter()
            .any(|e| e.record.original_topic == topic && e.record.key == key))
    }
}

/// Unrecoverable failures of one (topic, key) inside the poison window
#[derive(Debug, Clone, Copy)]
struct PoisonCount {
    count: u32,
    first_seen: DateTime<Utc>,
}

pub struct DeadLetterConsumer {
    config: DeadLetterConfig,
    bus: Arc<EventBus>,
    quarantine: Arc<dyn QuarantineStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    poison_counts: Mutex<HashMap<(String, String), PoisonCount>>,
}

impl DeadLetterConsumer {
    pub fn new(
        config: DeadLetterConfig,
        bus: Arc<EventBus>,
        quarantine: Arc<dyn QuarantineStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            bus,
            quarantine,
            clock,
            metrics,
            poison_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_unrecoverable(&self, error_class: &str) -> bool {
        self.config
            .unrecoverable_error_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(error_class))
    }

    pub async fn handle(&self, record: DeadLetterRecord) -> Result<Disposition> {
        if !topics::is_known(&record.original_topic) {
            warn!(topic = %record.original_topic, key = %record.key, "Dead letter for unknown topic");
            return Ok(Disposition::Discarded {
                reason: format!("unknown topic {}", record.original_topic),
            });
        }
        if self
            .quarantine
            .is_quarantined(&record.original_topic, &record.key)
            .await?
        {
            return Ok(Disposition::Discarded {
                reason: "key already quarantined".to_string(),
            });
        }

        if self.is_unrecoverable(&record.error_class) {
            let occurrences = self.count_failure(&record.original_topic, &record.key);

            if occurrences >= self.config.poison_threshold {
                let reason = format!(
                    "poison message: {} occurred {} times",
                    record.error_class, occurrences
                );
                self.reset_count(&record.original_topic, &record.key);
                return self.quarantine_record(record, reason).await;
            }
            return self.redeliver(&record).await;
        }

        if record.retry_count < self.config.max_redeliveries {
            self.redeliver(&record).await
        } else {
            let reason = format!("gave up after {} redeliveries", record.retry_count);
            self.quarantine_record(record, reason).await
        }
    }

    /// Send a quarantined record back to its primary topic.
    /// Returns false if no entry has this id.
    pub async fn release(&self, id: Uuid) -> Result<bool> {
        let Some(entry) = self.quarantine.take(id).await? else {
            return Ok(false);
        };

        if let Err(e) = self.republish(&entry.record).await {
            self.quarantine.quarantine(entry).await?;
            return Err(e);
        }
        self.reset_count(&entry.record.original_topic, &entry.record.key);
        info!(
            topic = %entry.record.original_topic,
            key = %entry.record.key,
            "Released quarantined message"
        );
        Ok(true)
    }

    pub async fn quarantined(&self) -> Result<Vec<QuarantineEntry>> {
        self.quarantine.list().await
    }

    /// Record one unrecoverable failure and return the count inside the
    /// window. Counts older than the window are dropped first.
    fn count_failure(&self, topic: &str, key: &str) -> u32 {
        let now = self.clock.now();
        let window = Duration::seconds(i64::try_from(self.config.poison_window_seconds).unwrap_or(i64::MAX / 1000));

        let mut counts = self.poison_counts.lock();
        counts.retain(|_, c| now - c.first_seen < window);

        let entry = counts
            .entry((topic.to_string(), key.to_string()))
            .or_insert(PoisonCount {
                count: 0,
                first_seen: now,
            });
        entry.count += 1;
        entry.count
    }

    /// Read a batch from `source`, handle each record and acknowledge the
    /// ones that were handled. A record whose handling failed stays
    /// unacknowledged and is offered again on a later drain.
    pub async fn drain(&self, source: &dyn DeadLetterSource, max: usize) -> Result<u64> {
        let deliveries = source.poll(max).await?;
        let mut handled = 0;

        for delivery in deliveries {
            match self.handle(delivery.record.clone()).await {
                Ok(disposition) => {
                    source.ack(&delivery).await?;
                    handled += 1;
                    debug!(
                        stream = %delivery.stream,
                        entry_id = %delivery.entry_id,
                        ?disposition,
                        "Dead letter handled"
                    );
                }
                Err(e) => warn!(
                    topic = %delivery.record.original_topic,
                    key = %delivery.record.key,
                    entry_id = %delivery.entry_id,
                    error = %e,
                    "Dead letter left pending"
                ),
            }
        }
        Ok(handled)
    }

    fn reset_count(&self, topic: &str, key: &str) {
        self.poison_counts
            .lock()
            .remove(&(topic.to_string(), key.to_string()));
    }

    async fn redeliver(&self, record: &DeadLetterRecord) -> Result<Disposition> {
        let attempt = self.republish(record).await?;
        self.metrics.messages_redelivered.increment();
        Ok(Disposition::Redeliver { attempt })
    }

    async fn republish(&self, record: &DeadLetterRecord) -> Result<u32> {
        let attempt = record.retry_count + 1;
        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            topic: record.original_topic.clone(),
            key: record.key.clone(),
            payload: record.payload.clone(),
            occurred_at: self.clock.now(),
            attempt,
        };
        self.bus
            .republish(&envelope)
            .await
            .map_err(|e| DispatchError::EventPublish {
                topic: envelope.topic.clone(),
                key: envelope.key.clone(),
                message: e.to_string(),
            })?;
        Ok(attempt)
    }

    async fn quarantine_record(&self, record: DeadLetterRecord, reason: String) -> Result<Disposition> {
        warn!(
            topic = %record.original_topic,
            key = %record.key,
            error_class = %record.error_class,
            reason = %reason,
            "Quarantining message"
        );
        self.quarantine
            .quarantine(QuarantineEntry {
                id: Uuid::new_v4(),
                record,
                reason: reason.clone(),
                quarantined_at: self.clock.now(),
            })
            .await?;
        self.metrics.messages_quarantined.increment();
        Ok(Disposition::Quarantined { reason })
    }
}

// ==================== Dead-Letter Sources ====================

/// One record read from a dead-letter stream, not yet acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterDelivery {
    pub stream: String,
    pub entry_id: String,
    pub record: DeadLetterRecord,
}

/// Where dead-lettered records are read from
#[async_trait]
pub trait DeadLetterSource: Send + Sync {
    /// Up to `max` records, including earlier deliveries that were never acknowledged
    async fn poll(&self, max: usize) -> Result<Vec<DeadLetterDelivery>>;

    async fn ack(&self, delivery: &DeadLetterDelivery) -> Result<()>;
}

/// Reads every `<topic>-dlq` stream through a Redis consumer group.
/// Each entry carries the record as JSON in its `payload` field.
#[derive(Clone)]
pub struct RedisStreamDeadLetterSource {
    conn: redis::aio::ConnectionManager,
    group: String,
    consumer: String,
    streams: Vec<String>,
}

impl RedisStreamDeadLetterSource {
    /// Create the consumer group on every dead-letter stream that lacks one
    pub async fn connect(
        conn: redis::aio::ConnectionManager,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self> {
        let source = Self {
            conn,
            group: group.into(),
            consumer: consumer.into(),
            streams: topics::ALL.iter().map(|t| topics::dead_letter(t)).collect(),
        };

        let mut conn = source.conn.clone();
        for stream in &source.streams {
            let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, &source.group, "0").await;
            match created {
                Ok(()) => debug!(stream = %stream, group = %source.group, "Created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(DispatchError::Storage(e.to_string())),
            }
        }
        Ok(source)
    }

    async fn read(&self, start: &str, max: usize) -> Result<Vec<DeadLetterDelivery>> {
        let mut conn = self.conn.clone();
        let ids = vec![start; self.streams.len()];
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);

        let reply: Option<StreamReadReply> = conn
            .xread_options(self.streams.as_slice(), ids.as_slice(), &opts)
            .await
            .map_err(|e| DispatchError::Storage(e.to_string()))?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                let decoded = entry
                    .get::<String>("payload")
                    .ok_or_else(|| "missing payload field".to_string())
                    .and_then(|raw| serde_json::from_str::<DeadLetterRecord>(&raw).map_err(|e| e.to_string()));
                match decoded {
                    Ok(record) => deliveries.push(DeadLetterDelivery {
                        stream: stream.key.clone(),
                        entry_id: entry.id,
                        record,
                    }),
                    Err(e) => {
                        warn!(stream = %stream.key, entry_id = %entry.id, error = %e, "Dropping malformed dead letter");
                        let _: u64 = conn
                            .xack(&stream.key, &self.group, &[&entry.id])
                            .await
                            .map_err(|e| DispatchError::Storage(e.to_string()))?;
                    }
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl DeadLetterSource for RedisStreamDeadLetterSource {
    async fn poll(&self, max: usize) -> Result<Vec<DeadLetterDelivery>> {
        // "0" replays this consumer's unacknowledged entries, ">" reads new ones
        let mut deliveries = self.read("0", max).await?;
        if deliveries.len() < max {
            deliveries.extend(self.read(">", max - deliveries.len()).await?);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &DeadLetterDelivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(&delivery.stream, &self.group, &[&delivery.entry_id])
            .await
            .map_err(|e| DispatchError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Keeps deliveries pending until acknowledged, like a consumer group
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryDeadLetterSource {
    pending: Mutex<Vec<DeadLetterDelivery>>,
    next_id: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl InMemoryDeadLetterSource {
    pub fn push(&self, record: DeadLetterRecord) {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.pending.lock().push(DeadLetterDelivery {
            stream: topics::dead_letter(&record.original_topic),
            entry_id: format!("{}-0", id),
            record,
        });
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl DeadLetterSource for InMemoryDeadLetterSource {
    async fn poll(&self, max: usize) -> Result<Vec<DeadLetterDelivery>> {
        Ok(self.pending.lock().iter().take(max).cloned().collect())
    }

    async fn ack(&self, delivery: &DeadLetterDelivery) -> Result<()> {
        self.pending.lock().retain(|d| d.entry_id != delivery.entry_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::InMemoryEventPublisher;
    use crate::testing;
    use assert_matches::assert_matches;
    use common::ManualClock;

    struct Harness {
        consumer: DeadLetterConsumer,
        publisher: Arc<InMemoryEventPublisher>,
        store: Arc<InMemoryQuarantineStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(testing::t0()));
        let metrics = Arc::new(EngineMetrics::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let bus = Arc::new(EventBus::new(publisher.clone(), clock.clone(), metrics.clone()));
        let store = Arc::new(InMemoryQuarantineStore::new());
        let consumer = DeadLetterConsumer::new(
            DeadLetterConfig::default(),
            bus,
            store.clone(),
            clock.clone(),
            metrics,
        );
        Harness {
            consumer,
            publisher,
            store,
            clock,
        }
    }

    fn record(error_class: &str, retry_count: u32) -> DeadLetterRecord {
        DeadLetterRecord {
            original_topic: topics::RIDE_MATCHED.to_string(),
            key: "ride-1".to_string(),
            payload: serde_json::json!({"type": "ride_matched"}),
            error_class: error_class.to_string(),
            error_message: "boom".to_string(),
            retry_count,
            failed_at: testing::t0(),
        }
    }

    #[tokio::test]
    async fn test_poison_message_quarantined_at_threshold() {
        let h = harness();

        for _ in 0..4 {
            let d = h.consumer.handle(record("serialization", 0)).await.unwrap();
            assert_matches!(d, Disposition::Redeliver { attempt: 1 });
        }
        let d = h.consumer.handle(record("SERIALIZATION", 0)).await.unwrap();
        assert_matches!(d, Disposition::Quarantined { .. });
        assert_eq!(h.store.list().await.unwrap().len(), 1);

        // further copies of the same key are dropped, not redelivered again
        let d = h.consumer.handle(record("SERIALIZATION", 0)).await.unwrap();
        assert_matches!(d, Disposition::Discarded { .. });
        assert_eq!(h.publisher.published_on(topics::RIDE_MATCHED).len(), 4);
    }

    #[tokio::test]
    async fn test_poison_counts_expire_after_window() {
        let h = harness();
        let window = chrono::Duration::seconds(DeadLetterConfig::default().poison_window_seconds as i64);

        for key in ["ride-1", "ride-2", "ride-3"] {
            let mut r = record("SERIALIZATION", 0);
            r.key = key.to_string();
            h.consumer.handle(r).await.unwrap();
        }
        assert_eq!(h.consumer.poison_counts.lock().len(), 3);

        h.clock.advance(window + chrono::Duration::seconds(1));
        h.consumer.handle(record("SERIALIZATION", 0)).await.unwrap();

        let counts = h.consumer.poison_counts.lock();
        assert_eq!(counts.len(), 1);
        let fresh = counts
            .get(&(topics::RIDE_MATCHED.to_string(), "ride-1".to_string()))
            .unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_poison_threshold_needs_failures_inside_window() {
        let h = harness();
        let window = chrono::Duration::seconds(DeadLetterConfig::default().poison_window_seconds as i64);

        for _ in 0..4 {
            h.consumer.handle(record("SERIALIZATION", 0)).await.unwrap();
        }
        h.clock.advance(window);
        let d = h.consumer.handle(record("SERIALIZATION", 0)).await.unwrap();
        assert_matches!(d, Disposition::Redeliver { .. });
        assert!(h.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_acks_handled_records() {
        let h = harness();
        let source = InMemoryDeadLetterSource::default();
        source.push(record("TIMEOUT", 0));
        source.push(record("TIMEOUT", 3));

        let handled = h.consumer.drain(&source, 10).await.unwrap();

        assert_eq!(handled, 2);
        assert_eq!(source.pending(), 0);
        assert_eq!(h.publisher.published_on(topics::RIDE_MATCHED).len(), 1);
        assert_eq!(h.store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_leaves_failed_records_pending() {
        let h = harness();
        h.publisher.fail_topic(topics::RIDE_MATCHED);
        let source = InMemoryDeadLetterSource::default();
        source.push(record("TIMEOUT", 0));
        let mut other = record("TIMEOUT", 3);
        other.key = "ride-2".to_string();
        source.push(other);

        let handled = h.consumer.drain(&source, 10).await.unwrap();

        // the redelivery failed, the quarantine did not need the bus
        assert_eq!(handled, 1);
        assert_eq!(source.pending(), 1);
        let left = source.poll(10).await.unwrap();
        assert_eq!(left[0].record.key, "ride-1");
        assert_eq!(left[0].stream, "ride-matched-dlq");
    }

    #[tokio::test]
    async fn test_recoverable_failure_redelivered_until_limit() {
        let h = harness();

        let d = h.consumer.handle(record("TIMEOUT", 2)).await.unwrap();
        assert_matches!(d, Disposition::Redeliver { attempt: 3 });
        let redelivered = h.publisher.published_on(topics::RIDE_MATCHED);
        assert_eq!(redelivered[0].attempt, 3);
        assert_eq!(redelivered[0].key, "ride-1");

        let d = h.consumer.handle(record("TIMEOUT", 3)).await.unwrap();
        assert_matches!(d, Disposition::Quarantined { .. });
    }

    #[tokio::test]
    async fn test_unknown_topic_discarded() {
        let h = harness();
        let mut r = record("TIMEOUT", 0);
        r.original_topic = "nobody-listens".to_string();

        let d = h.consumer.handle(r).await.unwrap();
        assert_matches!(d, Disposition::Discarded { .. });
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_release_republishes_and_clears_entry() {
        let h = harness();
        let d = h.consumer.handle(record("TIMEOUT", 3)).await.unwrap();
        assert_matches!(d, Disposition::Quarantined { .. });

        let entry = h.consumer.quarantined().await.unwrap().remove(0);
        assert!(h.consumer.release(entry.id).await.unwrap());
        assert!(h.store.list().await.unwrap().is_empty());
        assert_eq!(h.publisher.published_on(topics::RIDE_MATCHED).len(), 1);

        assert!(!h.consumer.release(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_redelivery_surfaces_error() {
        let h = harness();
        h.publisher.fail_topic(topics::RIDE_MATCHED);

        let result = h.consumer.handle(record("TIMEOUT", 0)).await;
        assert_matches!(result, Err(DispatchError::EventPublish { .. }));
    }

    #[test]
    fn test_record_wire_format_is_camel_case() {
        let json = serde_json::to_value(record("VALIDATION", 1)).unwrap();
        assert_eq!(json["originalTopic"], "ride-matched");
        assert_eq!(json["errorClass"], "VALIDATION");
        assert_eq!(json["retryCount"], 1);
        assert!(json.get("failedAt").is_some());
    }
}
