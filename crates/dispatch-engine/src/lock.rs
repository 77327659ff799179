//! Cluster-wide batch-run lock
//!
//! A lease-based mutual exclusion primitive. Holders never have to unlock
//! after a crash: the lease runs out on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Clock;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DispatchError, Result};

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    /// Random per-acquire token; release only succeeds with the same token
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait BatchLock: Send + Sync {
    /// Take the lock for `lease`, or `None` if someone else currently holds it
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<Option<Lease>>;

    /// Release if still held by this lease. Returns false when the lease had
    /// already expired or was taken over.
    async fn release(&self, lease: &Lease) -> Result<bool>;
}

fn lease_length(lease: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(lease).map_err(|e| DispatchError::Lock(format!("invalid lease: {}", e)))
}

// ==================== In-Memory Lock ====================

/// Process-local lock; honours lease expiry through the injected clock
pub struct InMemoryBatchLock {
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, Lease>>,
}

impl InMemoryBatchLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Current holder of `key`, ignoring expired leases
    #[cfg(test)]
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.held
            .lock()
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl BatchLock for InMemoryBatchLock {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<Option<Lease>> {
        let now = self.clock.now();
        let length = lease_length(lease)?;
        let mut held = self.held.lock();

        if let Some(current) = held.get(key) {
            if current.expires_at > now {
                debug!(key, holder = %current.owner, "Batch lock busy");
                return Ok(None);
            }
        }

        let granted = Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token: Uuid::new_v4().to_string(),
            expires_at: now + length,
        };
        held.insert(key.to_string(), granted.clone());
        Ok(Some(granted))
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut held = self.held.lock();
        match held.get(&lease.key) {
            Some(current) if current.token == lease.token => {
                held.remove(&lease.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ==================== Redis Lock ====================

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// `SET key token NX PX lease`, released by compare-and-delete
#[derive(Clone)]
pub struct RedisBatchLock {
    conn: redis::aio::ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisBatchLock {
    pub fn new(conn: redis::aio::ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    fn redis_key(key: &str) -> String {
        format!("lock:{}", key)
    }
}

#[async_trait]
impl BatchLock for RedisBatchLock {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<Option<Lease>> {
        let length = lease_length(lease)?;
        let token = format!("{}:{}", owner, Uuid::new_v4());
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::redis_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| DispatchError::Lock(format!("acquire {}: {}", key, e)))?;

        if reply.is_none() {
            debug!(key, "Batch lock busy");
            return Ok(None);
        }

        Ok(Some(Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            expires_at: self.clock.now() + length,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::redis_key(&lease.key))
            .arg(&lease.token)
            .invoke_async::<_, i32>(&mut conn)
            .await
            .map_err(|e| DispatchError::Lock(format!("release {}: {}", lease.key, e)))?;
        Ok(deleted == 1)
    }
}
