pub mod config;
pub mod context;
pub mod cookie;
pub mod directory;
pub mod errors;
mod forwarder;
pub mod headers;
pub mod metrics_defs;
pub mod paths;
pub mod pending;
mod proxy_service;
pub mod query_id;
pub mod routing;
pub mod rules_engine;
pub mod selector;

use crate::directory::{BackendDirectory, StaticDirectory};
use crate::errors::ProxyError;
use crate::forwarder::Forwarder;
use crate::paths::PathFilter;
use crate::proxy_service::ProxyService;
use crate::routing::RoutingEngine;
use crate::selector::RoutingGroupSelector;
use query_cache::QueryCacheManager;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

pub async fn run(config: config::Config) -> Result<(), ProxyError> {
    config.validate()?;

    let cache = Arc::new(QueryCacheManager::from_config(&config.query_cache).await?);
    let directory = Arc::new(StaticDirectory::from_config(&config.backends));
    let selector = RoutingGroupSelector::from_config(&config.selector).await?;
    let engine = Arc::new(RoutingEngine::new(
        &config,
        cache.clone(),
        directory.clone(),
        selector,
    )?);
    let forwarder = Forwarder::new(
        cache,
        config.routing.async_timeout(),
        config.routing.add_x_forwarded_headers,
        config.listener.port,
    );
    let path_filter = PathFilter::new(&config.statement_paths, &config.extra_whitelist_paths)?;

    tracing::info!(
        backends = config.backends.len(),
        default_group = %config.routing.default_routing_group,
        "starting gateway"
    );

    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        ProxyService::new(
            path_filter,
            engine,
            forwarder,
            config.routing.max_body_bytes,
        ),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::new(move || directory.has_active_backends()),
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}
