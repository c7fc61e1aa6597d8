use crate::config::{Config, LocalCacheConfig, ValidationError};
use crate::distributed::{DistributedCache, DistributedCacheError, RedisCache, cache_key};
use crate::history::{self, HistoryError, QueryHistoryStore};
use crate::local::{LocalCache, SetOutcome};
use crate::metrics_defs::{
    L1_HIT, L2_ERROR, L2_HIT, L2_MISS, L3_ERROR, L3_HIT, L3_MISS, WRITE_CONFLICT,
};
use crate::types::{CacheField, QueryDetail, QueryMetadata};
use async_trait::async_trait;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("history store error: {0}")]
    History(#[from] HistoryError),
    #[error("{0}")]
    Other(String),
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("invalid cache config: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not open history store: {0}")]
    History(#[from] HistoryError),
    #[error("could not create distributed cache: {0}")]
    Distributed(#[from] DistributedCacheError),
}

/// Last-resort lookup of a single field, consulted after L1 and L2 miss.
#[async_trait]
pub trait MetadataLoader: Send + Sync {
    async fn load(&self, field: CacheField, query_id: &str) -> Result<Option<String>, LoadError>;
}

/// Loads fields from the query history.
pub struct HistoryLoader {
    store: Arc<dyn QueryHistoryStore>,
}

impl HistoryLoader {
    pub fn new(store: Arc<dyn QueryHistoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MetadataLoader for HistoryLoader {
    async fn load(&self, field: CacheField, query_id: &str) -> Result<Option<String>, LoadError> {
        let detail = self.store.find(query_id).await?;
        Ok(detail.and_then(|d| d.metadata().get(field).map(String::from)))
    }
}

struct DistributedTier {
    cache: Arc<dyn DistributedCache>,
    namespace: String,
    ttl: Duration,
}

/// Read-through, write-back cache of query metadata over three tiers.
///
/// Reads go L1 → L2 → loader and backfill the faster tiers on the way out.
/// Writes are set-once per field: a value that differs from an already cached
/// one is logged and dropped, so every instance converges on the first writer.
pub struct QueryCacheManager {
    local: LocalCache,
    distributed: Option<DistributedTier>,
    loader: Option<Arc<dyn MetadataLoader>>,
    history: Option<Arc<dyn QueryHistoryStore>>,
}

impl QueryCacheManager {
    pub fn new(local: &LocalCacheConfig) -> Self {
        Self {
            local: LocalCache::new(local),
            distributed: None,
            loader: None,
            history: None,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self, BuildError> {
        config.validate()?;

        let history = history::from_config(&config.history).await?;
        let mut manager = Self::new(&config.local).with_history(history);

        if let Some(distributed) = &config.distributed {
            let cache = RedisCache::new(distributed)?;
            manager =
                manager.with_distributed(Arc::new(cache), &distributed.namespace, distributed.ttl());
        }
        Ok(manager)
    }

    pub fn with_distributed(
        mut self,
        cache: Arc<dyn DistributedCache>,
        namespace: &str,
        ttl: Duration,
    ) -> Self {
        self.distributed = Some(DistributedTier {
            cache,
            namespace: namespace.to_string(),
            ttl,
        });
        self
    }

    /// Uses `store` for [`record`](Self::record) and as the loader.
    pub fn with_history(mut self, store: Arc<dyn QueryHistoryStore>) -> Self {
        self.loader = Some(Arc::new(HistoryLoader::new(store.clone())));
        self.history = Some(store);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn MetadataLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub async fn get(&self, field: CacheField, query_id: &str) -> Option<String> {
        if let Some(value) = self.local.get(field, query_id).await {
            counter!(L1_HIT, "field" => field.as_str()).increment(1);
            return Some(value);
        }
        self.local
            .get_or_load(field, query_id, self.load_through(field, query_id))
            .await
    }

    pub async fn get_metadata(&self, query_id: &str) -> QueryMetadata {
        let (backend, routing_group, external_url) = tokio::join!(
            self.get(CacheField::Backend, query_id),
            self.get(CacheField::RoutingGroup, query_id),
            self.get(CacheField::ExternalUrl, query_id),
        );
        QueryMetadata::new(backend, routing_group, external_url)
    }

    /// Writes one field to L1 and, if that changed L1, to L2.
    /// Returns whether L1 changed.
    pub async fn set(&self, field: CacheField, query_id: &str, value: &str) -> bool {
        if !self.set_local_field(field, query_id, value).await {
            return false;
        }
        self.write_distributed(field, query_id, value).await;
        true
    }

    /// Writes every set field of `metadata`. Fields are written one at a time;
    /// a reader may observe some of them before the others.
    pub async fn update_all_caches(&self, query_id: &str, metadata: &QueryMetadata) {
        for (field, value) in metadata.fields() {
            self.set(field, query_id, value).await;
        }
    }

    /// Adds the fields of `partial` and returns what is now known.
    pub async fn update(&self, query_id: &str, partial: &QueryMetadata) -> QueryMetadata {
        self.update_all_caches(query_id, partial).await;
        self.get_metadata(query_id).await
    }

    /// Writes `metadata` to L1 only and returns the fields that were new.
    /// Pair with [`publish`](Self::publish) to write those to L2 later.
    pub async fn set_local(&self, query_id: &str, metadata: &QueryMetadata) -> QueryMetadata {
        let mut inserted = QueryMetadata::default();
        for (field, value) in metadata.fields() {
            if self.set_local_field(field, query_id, value).await {
                inserted.set(field, Some(value.to_string()));
            }
        }
        inserted
    }

    /// Writes `metadata` to L2 only.
    pub async fn publish(&self, query_id: &str, metadata: &QueryMetadata) {
        for (field, value) in metadata.fields() {
            self.write_distributed(field, query_id, value).await;
        }
    }

    pub async fn invalidate(&self, query_id: &str) {
        for field in CacheField::ALL {
            self.local.invalidate(field, query_id).await;
            if let Some(tier) = &self.distributed {
                let key = cache_key(&tier.namespace, field, query_id);
                if let Err(e) = tier.cache.delete(&key).await {
                    counter!(L2_ERROR, "op" => "delete").increment(1);
                    tracing::debug!(key = %key, error = %e, "distributed cache delete failed");
                }
            }
        }
    }

    /// Appends `detail` to the query history, if one is configured.
    pub async fn record(&self, detail: &QueryDetail) -> Result<(), HistoryError> {
        match &self.history {
            Some(history) => history.submit(detail).await,
            None => Ok(()),
        }
    }

    async fn set_local_field(&self, field: CacheField, query_id: &str, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        match self.local.insert_if_absent(field, query_id, value).await {
            SetOutcome::Inserted => true,
            SetOutcome::Unchanged => false,
            SetOutcome::Conflict { existing } => {
                counter!(WRITE_CONFLICT, "field" => field.as_str()).increment(1);
                tracing::error!(
                    query_id,
                    field = %field,
                    existing = %existing,
                    rejected = value,
                    "refusing to overwrite cached query metadata"
                );
                false
            }
        }
    }

    async fn load_through(&self, field: CacheField, query_id: &str) -> Option<String> {
        if let Some(tier) = &self.distributed {
            let key = cache_key(&tier.namespace, field, query_id);
            match tier.cache.get(&key).await {
                Ok(Some(value)) => {
                    counter!(L2_HIT, "field" => field.as_str()).increment(1);
                    return Some(value);
                }
                Ok(None) => counter!(L2_MISS, "field" => field.as_str()).increment(1),
                Err(e) => {
                    counter!(L2_ERROR, "op" => "get").increment(1);
                    tracing::debug!(key = %key, error = %e, "distributed cache read failed");
                }
            }
        }

        let loader = self.loader.as_ref()?;
        match loader.load(field, query_id).await {
            Ok(Some(value)) if !value.is_empty() => {
                counter!(L3_HIT, "field" => field.as_str()).increment(1);
                self.write_distributed(field, query_id, &value).await;
                Some(value)
            }
            Ok(_) => {
                counter!(L3_MISS, "field" => field.as_str()).increment(1);
                None
            }
            Err(e) => {
                counter!(L3_ERROR, "field" => field.as_str()).increment(1);
                tracing::warn!(query_id, field = %field, error = %e, "metadata loader failed");
                None
            }
        }
    }

    async fn write_distributed(&self, field: CacheField, query_id: &str, value: &str) {
        let Some(tier) = &self.distributed else {
            return;
        };
        let key = cache_key(&tier.namespace, field, query_id);
        match tier.cache.set_if_absent(&key, value, tier.ttl).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = %key, "distributed cache already holds a value"),
            Err(e) => {
                counter!(L2_ERROR, "op" => "set").increment(1);
                tracing::debug!(key = %key, error = %e, "distributed cache write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDistributedCache, MemoryHistoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUERY_ID: &str = "20240101_000000_00001_abcde";

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        value: Option<String>,
        delay: Duration,
    }

    #[async_trait]
    impl MetadataLoader for CountingLoader {
        async fn load(&self, _: CacheField, _: &str) -> Result<Option<String>, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.value.clone())
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl MetadataLoader for FailingLoader {
        async fn load(&self, _: CacheField, _: &str) -> Result<Option<String>, LoadError> {
            Err(LoadError::Other("database down".into()))
        }
    }

    struct FailingCache;

    #[async_trait]
    impl DistributedCache for FailingCache {
        async fn get(&self, _: &str) -> Result<Option<String>, DistributedCacheError> {
            Err(DistributedCacheError::Timeout)
        }

        async fn set_if_absent(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<bool, DistributedCacheError> {
            Err(DistributedCacheError::PoolExhausted)
        }

        async fn delete(&self, _: &str) -> Result<(), DistributedCacheError> {
            Err(DistributedCacheError::Unavailable)
        }
    }

    fn manager() -> QueryCacheManager {
        QueryCacheManager::new(&LocalCacheConfig::default())
    }

    fn with_l2(manager: QueryCacheManager, l2: &Arc<MemoryDistributedCache>) -> QueryCacheManager {
        manager.with_distributed(l2.clone(), "gw", Duration::from_secs(60))
    }

    fn backend_key() -> String {
        cache_key("gw", CacheField::Backend, QUERY_ID)
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let l2 = Arc::new(MemoryDistributedCache::default());
        l2.set_if_absent(&backend_key(), "http://a", Duration::from_secs(60))
            .await
            .unwrap();

        let loader = Arc::new(CountingLoader::default());
        let cache = with_l2(manager(), &l2).with_loader(loader.clone());

        assert_eq!(
            cache.get(CacheField::Backend, QUERY_ID).await.as_deref(),
            Some("http://a")
        );
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);

        // Served from L1 after the L2 entry disappears
        l2.delete(&backend_key()).await.unwrap();
        assert_eq!(
            cache.get(CacheField::Backend, QUERY_ID).await.as_deref(),
            Some("http://a")
        );
    }

    #[tokio::test]
    async fn test_loader_hit_backfills_l1_and_l2() {
        let l2 = Arc::new(MemoryDistributedCache::default());
        let loader = Arc::new(CountingLoader {
            value: Some("http://b".into()),
            ..Default::default()
        });
        let cache = with_l2(manager(), &l2).with_loader(loader.clone());

        assert_eq!(
            cache.get(CacheField::Backend, QUERY_ID).await.as_deref(),
            Some("http://b")
        );
        assert_eq!(
            l2.get(&backend_key()).await.unwrap().as_deref(),
            Some("http://b")
        );

        cache.get(CacheField::Backend, QUERY_ID).await;
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loader_failure_is_a_miss() {
        let cache = manager().with_loader(Arc::new(FailingLoader));
        assert!(cache.get(CacheField::Backend, QUERY_ID).await.is_none());
        assert!(cache.get_metadata(QUERY_ID).await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_l2_falls_through() {
        let loader = Arc::new(CountingLoader {
            value: Some("http://c".into()),
            ..Default::default()
        });
        let cache = manager()
            .with_distributed(Arc::new(FailingCache), "gw", Duration::from_secs(60))
            .with_loader(loader);

        assert_eq!(
            cache.get(CacheField::Backend, QUERY_ID).await.as_deref(),
            Some("http://c")
        );
        assert!(cache.set(CacheField::RoutingGroup, QUERY_ID, "etl").await);
        assert_eq!(
            cache.get(CacheField::RoutingGroup, QUERY_ID).await.as_deref(),
            Some("etl")
        );
        cache.invalidate(QUERY_ID).await;
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let loader = Arc::new(CountingLoader {
            value: Some("http://a".into()),
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let cache = Arc::new(manager().with_loader(loader.clone()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get(CacheField::Backend, QUERY_ID).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("http://a"));
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_never_overwrites() {
        let l2 = Arc::new(MemoryDistributedCache::default());
        let cache = with_l2(manager(), &l2);

        assert!(cache.set(CacheField::Backend, QUERY_ID, "http://a").await);
        assert!(!cache.set(CacheField::Backend, QUERY_ID, "http://a").await);
        assert!(!cache.set(CacheField::Backend, QUERY_ID, "http://b").await);
        assert!(!cache.set(CacheField::Backend, QUERY_ID, "").await);

        assert_eq!(
            cache.get(CacheField::Backend, QUERY_ID).await.as_deref(),
            Some("http://a")
        );
        assert_eq!(
            l2.get(&backend_key()).await.unwrap().as_deref(),
            Some("http://a")
        );
    }

    #[tokio::test]
    async fn test_update_fills_missing_fields_only() {
        let cache = manager();
        cache
            .update_all_caches(QUERY_ID, &QueryMetadata::with_backend("http://a"))
            .await;

        let merged = cache
            .update(
                QUERY_ID,
                &QueryMetadata::new(
                    Some("http://b".into()),
                    Some("etl".into()),
                    Some("https://etl.example.com".into()),
                ),
            )
            .await;

        assert_eq!(
            merged,
            QueryMetadata::new(
                Some("http://a".into()),
                Some("etl".into()),
                Some("https://etl.example.com".into()),
            )
        );
    }

    #[tokio::test]
    async fn test_writes_are_visible_to_other_instances() {
        let l2 = Arc::new(MemoryDistributedCache::default());
        let first = with_l2(manager(), &l2);
        let second = with_l2(manager(), &l2);

        let metadata = QueryMetadata::new(Some("http://a".into()), Some("adhoc".into()), None);
        let inserted = first.set_local(QUERY_ID, &metadata).await;
        assert_eq!(inserted, metadata);
        assert!(second.get_metadata(QUERY_ID).await.is_empty());

        first.publish(QUERY_ID, &inserted).await;
        assert_eq!(second.get_metadata(QUERY_ID).await, metadata);

        // Nothing new on the second write, so nothing to publish
        assert!(first.set_local(QUERY_ID, &metadata).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let l2 = Arc::new(MemoryDistributedCache::default());
        let cache = with_l2(manager(), &l2);
        cache
            .update_all_caches(QUERY_ID, &QueryMetadata::with_backend("http://a"))
            .await;

        cache.invalidate(QUERY_ID).await;
        assert!(cache.get(CacheField::Backend, QUERY_ID).await.is_none());
        assert!(l2.is_empty().await);
    }

    #[tokio::test]
    async fn test_history_backs_the_cache() {
        let store = Arc::new(MemoryHistoryStore::default());
        let cache = manager().with_history(store.clone());

        cache
            .record(&QueryDetail {
                query_id: QUERY_ID.into(),
                query_text: "select 1".into(),
                backend_url: "http://a".into(),
                user: None,
                source: None,
                routing_group: Some("adhoc".into()),
                external_url: None,
                captured_at_ms: 0,
            })
            .await
            .unwrap();

        // A fresh instance over the same history
        let other = manager().with_history(store);
        assert_eq!(
            other.get_metadata(QUERY_ID).await,
            QueryMetadata::new(Some("http://a".into()), Some("adhoc".into()), None)
        );
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = Config::default();
        let cache = QueryCacheManager::from_config(&config).await.unwrap();
        assert!(cache.set(CacheField::Backend, QUERY_ID, "http://a").await);
    }
}
