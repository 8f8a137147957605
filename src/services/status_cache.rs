//! Batch status cache
//!
//! The only record of batch state: a bounded map from batch id to the three
//! status fields, evicted LRU-style under pressure. Eviction loses the record
//! for good - the input and results still live in object storage, keyed by
//! id. The trait keeps the cache swappable for a process-external store; the
//! in-memory backend never actually fails, but callers treat every operation
//! as fallible.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use moka::sync::Cache;
use tracing::info;

use crate::errors::ServiceError;
use crate::types::BatchStatus;

/// The three persisted fields of a batch record. `status` stays a string on
/// the cache side; readers parse it and surface `UNDEFINED` for values that
/// do not name a known state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: String,
    pub download_path: String,
    /// RFC 3339 with nanoseconds
    pub update_time: String,
}

impl StatusEntry {
    pub fn new(status: BatchStatus, download_path: impl Into<String>) -> Self {
        Self {
            status: status.as_str().to_string(),
            download_path: download_path.into(),
            update_time: now_rfc3339_nanos(),
        }
    }
}

/// Current wall-clock time in the cache's timestamp format.
pub fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn set(&self, id: &str, entry: StatusEntry) -> Result<(), ServiceError>;

    /// `Ok(None)` when the id was never written or has been evicted.
    async fn get(&self, id: &str) -> Result<Option<StatusEntry>, ServiceError>;

    fn name(&self) -> &'static str;
}

/// Capacity-bounded in-memory status cache (all-keys-LRU analogue).
pub struct MemoryStatusCache {
    inner: Cache<String, StatusEntry>,
}

impl MemoryStatusCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(capacity).build(),
        }
    }
}

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn set(&self, id: &str, entry: StatusEntry) -> Result<(), ServiceError> {
        self.inner.insert(id.to_string(), entry);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StatusEntry>, ServiceError> {
        Ok(self.inner.get(id))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub fn create_status_cache(capacity: u64) -> Arc<dyn StatusCache> {
    info!(
        "status cache ready (allkeys-lru, capacity {})",
        capacity
    );
    Arc::new(MemoryStatusCache::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_returns_all_three_fields() {
        let cache = MemoryStatusCache::new(64);
        let entry = StatusEntry::new(BatchStatus::Accepted, "");

        cache.set("batch-1", entry.clone()).await.unwrap();
        let got = cache.get("batch-1").await.unwrap().unwrap();

        assert_eq!(got.status, "ACCEPTED");
        assert_eq!(got.download_path, "");
        assert_eq!(got.update_time, entry.update_time);
    }

    #[tokio::test]
    async fn absent_ids_read_as_none() {
        let cache = MemoryStatusCache::new(64);
        assert!(cache.get("never-written").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_writes_overwrite_earlier_state() {
        let cache = MemoryStatusCache::new(64);
        cache
            .set("batch-1", StatusEntry::new(BatchStatus::Accepted, ""))
            .await
            .unwrap();
        cache
            .set(
                "batch-1",
                StatusEntry::new(BatchStatus::Success, "/tmp/batch-1-results.json"),
            )
            .await
            .unwrap();

        let got = cache.get("batch-1").await.unwrap().unwrap();
        assert_eq!(got.status, "SUCCESS");
        assert_eq!(got.download_path, "/tmp/batch-1-results.json");
    }

    #[test]
    fn timestamps_carry_nanosecond_precision() {
        let ts = now_rfc3339_nanos();
        let parsed = chrono::DateTime::parse_from_rfc3339(&ts).unwrap();
        assert!(parsed.timestamp() > 0);
        // nine fractional digits before the zone designator
        let frac = ts.split('.').nth(1).unwrap();
        assert_eq!(frac.trim_end_matches('Z').len(), 9);
    }
}
