//! Idempotency ledger: content-addressed dedupe of side-effecting operations.
//!
//! Epistemic foundation:
//! - K_i: A key maps to at most one stored response
//! - K_i: Expired records behave as a miss and are lazily evicted
//! - I^B: Retries of side-effecting operations ("publish once") are made safe
//!   by the check-before / store-after bracket at the call site

use crate::models::IdempotencyConfig;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Stored outcome of one side-effecting operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_data: serde_json::Value,
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Process-wide dedupe ledger with TTL expiry.
///
/// Read and written by many concurrent callers; per-key atomicity comes
/// from the sharded map.
pub struct IdempotencyLedger {
    records: DashMap<String, IdempotencyRecord>,
    ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            records: DashMap::new(),
            ttl: Duration::seconds(config.ttl_secs as i64),
        }
    }

    /// Derive a deterministic key for one operation instance.
    ///
    /// SHA-256 over batch_id, item_id, operation and optional extra data;
    /// identical inputs always produce identical keys.
    pub fn generate_key(
        batch_id: &str,
        item_id: &str,
        operation: &str,
        extra: Option<&serde_json::Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(batch_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(item_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(operation.as_bytes());
        if let Some(extra) = extra {
            hasher.update([0u8]);
            hasher.update(extra.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Return the stored response for a live record, or `None` on a miss.
    ///
    /// An expired record is evicted here and reported as a miss.
    pub fn check_duplicate(&self, key: &str) -> Option<serde_json::Value> {
        let now = Utc::now();
        // Clone out of the shard guard before any removal; holding a read
        // guard across remove() on the same key would deadlock.
        let hit = match self.records.get(key) {
            Some(record) if !record.is_expired(now) => Some(record.response.clone()),
            Some(_) => None,
            None => return None,
        };
        match hit {
            Some(response) => {
                debug!(key = %key, "Idempotency hit, skipping execution");
                Some(response)
            }
            None => {
                self.records.remove(key);
                None
            }
        }
    }

    /// Store the outcome of an executed operation under its key.
    pub fn store_result(
        &self,
        key: &str,
        request_data: serde_json::Value,
        response: serde_json::Value,
    ) {
        let now = Utc::now();
        self.records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                request_data,
                response,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Sweep every expired record. Returns the number evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let evicted = before - self.records.len();
        if evicted > 0 {
            debug!(evicted, "Swept expired idempotency records");
        }
        evicted
    }

    /// Number of live records (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
