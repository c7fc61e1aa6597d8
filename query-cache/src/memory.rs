//! In-memory tier implementations for single-instance setups and tests.
//!
//! Both are bounded: entries expire and the least recently used are evicted
//! once `max_entries` is reached.

use crate::distributed::{DistributedCache, DistributedCacheError};
use crate::history::{HistoryError, QueryHistoryStore};
use crate::types::{QueryDetail, truncate_query_text};
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

/// Expires each entry after the ttl it was written with.
struct WrittenTtl;

impl Expiry<String, Entry> for WrittenTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Stand-in for Redis, shared between gateway instances in one process.
pub struct MemoryDistributedCache {
    entries: Cache<String, Entry>,
}

impl MemoryDistributedCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(WrittenTtl)
                .build(),
        }
    }

    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryDistributedCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, DistributedCacheError> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, DistributedCacheError> {
        let entry = Entry {
            value: value.to_string(),
            ttl,
        };
        Ok(self
            .entries
            .entry(key.to_string())
            .or_insert(entry)
            .await
            .is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<(), DistributedCacheError> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

/// Query history kept for `retention` in process memory.
pub struct MemoryHistoryStore {
    details: Cache<String, QueryDetail>,
}

impl MemoryHistoryStore {
    pub fn new(max_entries: u64, retention: Duration) -> Self {
        Self {
            details: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(retention)
                .build(),
        }
    }

    pub async fn len(&self) -> u64 {
        self.details.run_pending_tasks().await;
        self.details.entry_count()
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, crate::config::default_retention())
    }
}

#[async_trait]
impl QueryHistoryStore for MemoryHistoryStore {
    async fn submit(&self, detail: &QueryDetail) -> Result<(), HistoryError> {
        self.details
            .entry(detail.query_id.clone())
            .or_insert_with(async {
                QueryDetail {
                    query_text: truncate_query_text(&detail.query_text),
                    ..detail.clone()
                }
            })
            .await;
        Ok(())
    }

    async fn find(&self, query_id: &str) -> Result<Option<QueryDetail>, HistoryError> {
        Ok(self.details.get(query_id).await)
    }
}
