use crate::config::LocalCacheConfig;
use crate::types::CacheField;
use moka::future::Cache;
use std::future::Future;

/// Outcome of a set-once write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    /// The same value was already present.
    Unchanged,
    /// A different value was already present and was kept.
    Conflict { existing: String },
}

/// In-process tier: one bounded moka cache per field, keyed by query id.
pub(crate) struct LocalCache {
    backend: Cache<String, String>,
    routing_group: Cache<String, String>,
    external_url: Cache<String, String>,
}

impl LocalCache {
    pub fn new(config: &LocalCacheConfig) -> Self {
        let build = || {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_idle(config.idle_timeout())
                .build()
        };
        Self {
            backend: build(),
            routing_group: build(),
            external_url: build(),
        }
    }

    fn cache(&self, field: CacheField) -> &Cache<String, String> {
        match field {
            CacheField::Backend => &self.backend,
            CacheField::RoutingGroup => &self.routing_group,
            CacheField::ExternalUrl => &self.external_url,
        }
    }

    pub async fn get(&self, field: CacheField, query_id: &str) -> Option<String> {
        self.cache(field).get(query_id).await
    }

    /// Returns the cached value or runs `load`. Concurrent callers for the same
    /// key wait on a single `load`; a `None` result is not cached.
    pub async fn get_or_load<F>(&self, field: CacheField, query_id: &str, load: F) -> Option<String>
    where
        F: Future<Output = Option<String>>,
    {
        self.cache(field)
            .optionally_get_with(query_id.to_string(), load)
            .await
    }

    pub async fn insert_if_absent(
        &self,
        field: CacheField,
        query_id: &str,
        value: &str,
    ) -> SetOutcome {
        let entry = self
            .cache(field)
            .entry(query_id.to_string())
            .or_insert(value.to_string())
            .await;

        if entry.is_fresh() {
            return SetOutcome::Inserted;
        }
        let existing = entry.into_value();
        if existing == value {
            SetOutcome::Unchanged
        } else {
            SetOutcome::Conflict { existing }
        }
    }

    pub async fn invalidate(&self, field: CacheField, query_id: &str) {
        self.cache(field).invalidate(query_id).await;
    }
}
