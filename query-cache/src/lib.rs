//! Query to backend affinity storage.
//!
//! Lookups go through three tiers: an in-process cache (L1), an optional
//! distributed cache shared by every gateway instance (L2), and the durable
//! query history (L3). See [`QueryCacheManager`].

pub mod config;
pub mod distributed;
pub mod history;
mod local;
pub mod manager;
pub mod memory;
pub mod metrics_defs;
pub mod types;

pub use manager::{MetadataLoader, QueryCacheManager};
pub use types::{CacheField, QueryDetail, QueryMetadata};
