use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("local cache max_entries must be greater than 0")]
    InvalidLocalCapacity,

    #[error("distributed cache url cannot be empty")]
    EmptyDistributedUrl,

    #[error("distributed cache namespace cannot be empty")]
    EmptyNamespace,

    #[error("distributed cache ttl_secs must be greater than 0")]
    InvalidTtl,

    #[error("distributed cache max_connections must be greater than 0")]
    InvalidMaxConnections,

    #[error("history max_entries must be greater than 0")]
    InvalidHistoryCapacity,

    #[error("history retention_hours must be greater than 0")]
    InvalidHistoryRetention,

    #[error("history cleanup_interval_secs must be greater than 0")]
    InvalidCleanupInterval,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub local: LocalCacheConfig,
    /// L2 is skipped entirely when this is absent.
    #[serde(default)]
    pub distributed: Option<DistributedCacheConfig>,
    #[serde(default)]
    pub history: HistoryStoreConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.local.max_entries == 0 {
            return Err(ValidationError::InvalidLocalCapacity);
        }
        if let Some(distributed) = &self.distributed {
            distributed.validate()?;
        }
        self.history.validate()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LocalCacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Entries not read for this long are evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl LocalCacheConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DistributedCacheConfig {
    /// Redis connection url, e.g. `redis://cache.internal:6379/0`.
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on concurrent commands in flight.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long a caller waits for a free slot before skipping L2.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// After a failure, L2 is bypassed for this long.
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
}

impl DistributedCacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::EmptyDistributedUrl);
        }
        if self.namespace.is_empty() {
            return Err(ValidationError::EmptyNamespace);
        }
        if self.ttl_secs == 0 {
            return Err(ValidationError::InvalidTtl);
        }
        if self.max_connections == 0 {
            return Err(ValidationError::InvalidMaxConnections);
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum HistoryStoreConfig {
    /// Bounded and local to the instance. Lost on restart.
    Memory {
        #[serde(default = "default_history_max_entries")]
        max_entries: u64,
        #[serde(default = "default_retention_hours")]
        retention_hours: u64,
    },
    Sqlite {
        path: PathBuf,
        /// Records older than this are purged.
        #[serde(default = "default_retention_hours")]
        retention_hours: u64,
        #[serde(default = "default_cleanup_interval_secs")]
        cleanup_interval_secs: u64,
    },
}

impl Default for HistoryStoreConfig {
    fn default() -> Self {
        Self::Memory {
            max_entries: default_history_max_entries(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl HistoryStoreConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Sqlite {
            path: path.into(),
            retention_hours: default_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Memory {
                max_entries,
                retention_hours,
            } => {
                if *max_entries == 0 {
                    return Err(ValidationError::InvalidHistoryCapacity);
                }
                if *retention_hours == 0 {
                    return Err(ValidationError::InvalidHistoryRetention);
                }
            }
            Self::Sqlite {
                retention_hours,
                cleanup_interval_secs,
                ..
            } => {
                if *retention_hours == 0 {
                    return Err(ValidationError::InvalidHistoryRetention);
                }
                if *cleanup_interval_secs == 0 {
                    return Err(ValidationError::InvalidCleanupInterval);
                }
            }
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        let hours = match self {
            Self::Memory {
                retention_hours, ..
            }
            | Self::Sqlite {
                retention_hours, ..
            } => *retention_hours,
        };
        Duration::from_secs(hours * 60 * 60)
    }
}

pub(crate) fn default_retention() -> Duration {
    Duration::from_secs(default_retention_hours() * 60 * 60)
}

fn default_history_max_entries() -> u64 {
    crate::memory::DEFAULT_MAX_ENTRIES
}

fn default_retention_hours() -> u64 {
    4
}

fn default_cleanup_interval_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_namespace() -> String {
    "gateway".into()
}

fn default_ttl_secs() -> u64 {
    30 * 60
}

fn default_max_connections() -> usize {
    16
}

fn default_acquire_timeout_ms() -> u64 {
    200
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_retry_after_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.local.max_entries, 10_000);
        assert_eq!(config.local.idle_timeout(), Duration::from_secs(1800));
        assert!(config.distributed.is_none());
        assert_eq!(
            config.history,
            HistoryStoreConfig::Memory {
                max_entries: 100_000,
                retention_hours: 4
            }
        );
        assert_eq!(config.history.retention(), Duration::from_secs(4 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            local:
                max_entries: 500
            distributed:
                url: redis://127.0.0.1:6379
                namespace: gw
                ttl_secs: 60
            history:
                type: sqlite
                path: /var/lib/gateway/history.db
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let distributed = config.distributed.as_ref().unwrap();
        assert_eq!(distributed.namespace, "gw");
        assert_eq!(distributed.max_connections, 16);
        assert_eq!(
            config.history,
            HistoryStoreConfig::sqlite("/var/lib/gateway/history.db")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_history_retention() {
        let yaml = r#"
            history:
                type: sqlite
                path: history.db
                retention_hours: 24
                cleanup_interval_secs: 600
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.history.retention(), Duration::from_secs(24 * 3600));
        assert!(matches!(
            config.history,
            HistoryStoreConfig::Sqlite {
                cleanup_interval_secs: 600,
                ..
            }
        ));

        let yaml = "history:\n  type: memory\n  retention_hours: 0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ValidationError::InvalidHistoryRetention));

        let yaml = "history:\n  type: memory\n  max_entries: 0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ValidationError::InvalidHistoryCapacity));

        let yaml = "history:\n  type: sqlite\n  path: h.db\n  cleanup_interval_secs: 0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ValidationError::InvalidCleanupInterval));
    }

    #[test]
    fn test_validation() {
        let yaml = r#"
            distributed:
                url: redis://127.0.0.1:6379
                namespace: ""
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ValidationError::EmptyNamespace));

        let yaml = "local:\n  max_entries: 0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ValidationError::InvalidLocalCapacity));
    }
}
