use crate::config::HistoryStoreConfig;
use crate::memory::MemoryHistoryStore;
use crate::metrics_defs::HISTORY_PURGED;
use crate::types::{QueryDetail, truncate_query_text};
use async_trait::async_trait;
use shared::counter;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS query_history (
    query_id TEXT PRIMARY KEY NOT NULL,
    query_text TEXT NOT NULL,
    backend_url TEXT NOT NULL,
    user_name TEXT,
    source TEXT,
    routing_group TEXT,
    external_url TEXT,
    created INTEGER NOT NULL
)
"#;

const CREATED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS query_history_created ON query_history (created)";

#[derive(thiserror::Error, Debug)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable record of submitted queries. Source of truth behind the caches.
#[async_trait]
pub trait QueryHistoryStore: Send + Sync {
    /// Records `detail`. Recording the same query id again is a no-op.
    async fn submit(&self, detail: &QueryDetail) -> Result<(), HistoryError>;

    async fn find(&self, query_id: &str) -> Result<Option<QueryDetail>, HistoryError>;
}

pub async fn from_config(
    config: &HistoryStoreConfig,
) -> Result<Arc<dyn QueryHistoryStore>, HistoryError> {
    Ok(match config {
        HistoryStoreConfig::Memory { max_entries, .. } => {
            Arc::new(MemoryHistoryStore::new(*max_entries, config.retention()))
        }
        HistoryStoreConfig::Sqlite {
            path,
            cleanup_interval_secs,
            ..
        } => {
            let store = Arc::new(SqliteHistoryStore::open(path).await?);
            store.spawn_cleanup(config.retention(), Duration::from_secs(*cleanup_interval_secs));
            store
        }
    })
}

#[derive(sqlx::FromRow)]
struct QueryHistoryRow {
    query_id: String,
    query_text: String,
    backend_url: String,
    user_name: Option<String>,
    source: Option<String>,
    routing_group: Option<String>,
    external_url: Option<String>,
    created: i64,
}

impl From<QueryHistoryRow> for QueryDetail {
    fn from(row: QueryHistoryRow) -> Self {
        QueryDetail {
            query_id: row.query_id,
            query_text: row.query_text,
            backend_url: row.backend_url,
            user: row.user_name,
            source: row.source,
            routing_group: row.routing_group,
            external_url: row.external_url,
            captured_at_ms: row.created,
        }
    }
}

pub struct SqliteHistoryStore {
    pool: Pool<Sqlite>,
}

impl SqliteHistoryStore {
    pub async fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(opts).await
    }

    pub async fn in_memory() -> Result<Self, HistoryError> {
        Self::connect(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<Self, HistoryError> {
        // A single long-lived connection; an in-memory database lives only as
        // long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        sqlx::query(CREATED_INDEX_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Deletes records captured before `cutoff_ms` and returns how many.
    pub async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64, HistoryError> {
        let result = sqlx::query("DELETE FROM query_history WHERE created < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Purges records older than `retention` every `every`, starting now.
    /// The task ends once the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, retention: Duration, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let cutoff = now_ms().saturating_sub(retention.as_millis() as i64);
                match store.purge_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => {
                        counter!(HISTORY_PURGED).increment(purged);
                        tracing::info!(purged, "purged expired query history");
                    }
                    Err(e) => tracing::warn!(error = %e, "could not purge query history"),
                }
            }
        })
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl QueryHistoryStore for SqliteHistoryStore {
    async fn submit(&self, detail: &QueryDetail) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO query_history \
             (query_id, query_text, backend_url, user_name, source, routing_group, external_url, created) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&detail.query_id)
        .bind(truncate_query_text(&detail.query_text))
        .bind(&detail.backend_url)
        .bind(&detail.user)
        .bind(&detail.source)
        .bind(&detail.routing_group)
        .bind(&detail.external_url)
        .bind(detail.captured_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, query_id: &str) -> Result<Option<QueryDetail>, HistoryError> {
        let row = sqlx::query_as::<_, QueryHistoryRow>(
            "SELECT * FROM query_history WHERE query_id = ?",
        )
        .bind(query_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(QueryDetail::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(query_id: &str, backend_url: &str) -> QueryDetail {
        QueryDetail {
            query_id: query_id.into(),
            query_text: "select 1".into(),
            backend_url: backend_url.into(),
            user: Some("alice".into()),
            source: None,
            routing_group: Some("adhoc".into()),
            external_url: None,
            captured_at_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_submit_and_find() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let id = "20240101_000000_00001_abcde";

        assert!(store.find(id).await.unwrap().is_none());
        store.submit(&detail(id, "http://a:8080")).await.unwrap();
        assert_eq!(
            store.find(id).await.unwrap(),
            Some(detail(id, "http://a:8080"))
        );
    }

    #[tokio::test]
    async fn test_resubmit_keeps_first_record() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let id = "20240101_000000_00001_abcde";

        store.submit(&detail(id, "http://a:8080")).await.unwrap();
        store.submit(&detail(id, "http://b:8080")).await.unwrap();
        let found = store.find(id).await.unwrap().unwrap();
        assert_eq!(found.backend_url, "http://a:8080");
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        let id = "20240101_000000_00002_fghij";

        {
            let store = SqliteHistoryStore::open(&path).await.unwrap();
            store.submit(&detail(id, "http://a:8080")).await.unwrap();
        }

        let store = SqliteHistoryStore::open(&path).await.unwrap();
        let found = store.find(id).await.unwrap().unwrap();
        assert_eq!(found.routing_group.as_deref(), Some("adhoc"));
    }

    #[tokio::test]
    async fn test_long_query_text_is_truncated() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let mut long = detail("20240101_000000_00003_klmno", "http://a:8080");
        long.query_text = "x".repeat(1000);
        store.submit(&long).await.unwrap();

        let found = store.find(&long.query_id).await.unwrap().unwrap();
        assert_eq!(found.query_text.len(), 200);
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let mut old = detail("20240101_000000_00001_abcde", "http://a:8080");
        old.captured_at_ms = 1_000;
        let mut recent = detail("20240101_000000_00002_fghij", "http://a:8080");
        recent.captured_at_ms = 5_000;
        store.submit(&old).await.unwrap();
        store.submit(&recent).await.unwrap();

        assert_eq!(store.purge_older_than(5_000).await.unwrap(), 1);
        assert!(store.find(&old.query_id).await.unwrap().is_none());
        assert!(store.find(&recent.query_id).await.unwrap().is_some());
        assert_eq!(store.purge_older_than(5_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_purges_expired_records() {
        let store = Arc::new(SqliteHistoryStore::in_memory().await.unwrap());
        let expired = detail("20240101_000000_00001_abcde", "http://a:8080");
        let mut fresh = detail("20240101_000000_00002_fghij", "http://a:8080");
        fresh.captured_at_ms = now_ms();
        store.submit(&expired).await.unwrap();
        store.submit(&fresh).await.unwrap();

        let task = store.spawn_cleanup(Duration::from_secs(3600), Duration::from_millis(20));
        let mut purged = false;
        for _ in 0..50 {
            if store.find(&expired.query_id).await.unwrap().is_none() {
                purged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(purged);
        assert!(store.find(&fresh.query_id).await.unwrap().is_some());

        // the task stops with the store
        drop(store);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
