use crate::config::DistributedCacheConfig;
use crate::types::CacheField;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::timeout;

#[derive(thiserror::Error, Debug)]
pub enum DistributedCacheError {
    #[error("no connection slot available")]
    PoolExhausted,
    #[error("command timed out")]
    Timeout,
    #[error("distributed cache marked unavailable")]
    Unavailable,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key/value store shared by every gateway instance.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DistributedCacheError>;

    /// Stores `value` only if `key` is not present. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, DistributedCacheError>;

    async fn delete(&self, key: &str) -> Result<(), DistributedCacheError>;
}

/// `<namespace>:query:<field>:<query_id>`
pub fn cache_key(namespace: &str, field: CacheField, query_id: &str) -> String {
    format!("{namespace}:query:{field}:{query_id}")
}

/// Redis backed [`DistributedCache`].
///
/// The connection is established lazily so the gateway starts without Redis.
/// Concurrency is bounded by a semaphore; callers that cannot get a slot within
/// `acquire_timeout` fail fast instead of queueing. Any failure disables the
/// tier for `retry_after`.
pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    permits: Semaphore,
    acquire_timeout: Duration,
    command_timeout: Duration,
    retry_after: Duration,
    unhealthy_until: Mutex<Option<Instant>>,
}

impl RedisCache {
    pub fn new(config: &DistributedCacheConfig) -> Result<Self, DistributedCacheError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            permits: Semaphore::new(config.max_connections),
            acquire_timeout: config.acquire_timeout(),
            command_timeout: config.command_timeout(),
            retry_after: config.retry_after(),
            unhealthy_until: Mutex::new(None),
        })
    }

    pub fn is_healthy(&self) -> bool {
        let mut guard = self.unhealthy_until.lock();
        match *guard {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *guard = None;
                true
            }
            None => true,
        }
    }

    fn mark_unhealthy(&self, error: &DistributedCacheError) {
        tracing::warn!(
            error = %error,
            retry_after_secs = self.retry_after.as_secs(),
            "distributed cache failure, bypassing it"
        );
        *self.unhealthy_until.lock() = Some(Instant::now() + self.retry_after);
    }

    async fn connection(&self) -> Result<ConnectionManager, DistributedCacheError> {
        let init = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()));
        match timeout(self.command_timeout, init).await {
            Ok(Ok(conn)) => Ok(conn.clone()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DistributedCacheError::Timeout),
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, DistributedCacheError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        if !self.is_healthy() {
            return Err(DistributedCacheError::Unavailable);
        }

        let _permit = timeout(self.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| DistributedCacheError::PoolExhausted)?
            .map_err(|_| DistributedCacheError::PoolExhausted)?;

        let result = match self.connection().await {
            Ok(conn) => match timeout(self.command_timeout, op(conn)).await {
                Ok(res) => res.map_err(DistributedCacheError::from),
                Err(_) => Err(DistributedCacheError::Timeout),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.mark_unhealthy(e);
        }
        result
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, DistributedCacheError> {
        let key = key.to_string();
        self.run(|mut conn| async move {
            let value: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, DistributedCacheError> {
        let key = key.to_string();
        let value = value.to_string();
        let ttl_secs = ttl.as_secs().max(1);
        self.run(|mut conn| async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), DistributedCacheError> {
        let key = key.to_string();
        self.run(|mut conn| async move {
            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> DistributedCacheConfig {
        DistributedCacheConfig {
            url: url.into(),
            namespace: "gw".into(),
            ttl_secs: 60,
            max_connections: 2,
            acquire_timeout_ms: 50,
            command_timeout_ms: 200,
            retry_after_secs: 30,
        }
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(
            cache_key("gw", CacheField::RoutingGroup, "20240101_000000_00001_abcde"),
            "gw:query:routing_group:20240101_000000_00001_abcde"
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(RedisCache::new(&config("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_bypassed() {
        // Nothing listens on port 1
        let cache = RedisCache::new(&config("redis://127.0.0.1:1")).unwrap();
        assert!(cache.is_healthy());

        assert!(cache.get("gw:query:backend:q1").await.is_err());
        assert!(!cache.is_healthy());

        // Subsequent calls skip the network entirely
        assert!(matches!(
            cache.get("gw:query:backend:q1").await,
            Err(DistributedCacheError::Unavailable)
        ));
    }
}
