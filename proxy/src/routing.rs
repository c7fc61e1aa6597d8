use crate::config::{BackendSelection, Config, CookieFamily, RoutingConfig};
use crate::context::RequestContext;
use crate::cookie::{
    AffinityCookie, CookieClaims, CookieEvaluation, CookieSigner, evaluate_cookies, now_ms,
};
use crate::directory::{Backend, BackendDirectory};
use crate::metrics_defs::{BACKEND_PROBE, ROUTING_DECISION, ROUTING_FAILURE};
use crate::pending::PendingSubmission;
use crate::query_id::QueryIdExtractor;
use crate::selector::{RoutingGroupSelector, SelectorError};
use http::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderName};
use http::{Method, Uri};
use query_cache::types::truncate_query_text;
use query_cache::{CacheField, QueryCacheManager};
use rand::Rng;
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] InvalidHeaderName),
    #[error("could not build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum RoutingError {
    #[error("no active backend for routing group {0}")]
    NoActiveBackend(String),
    #[error("no backend available in routing group {0}")]
    NoBackendAvailable(String),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("invalid destination uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
}

/// How the destination was chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteSource {
    QueryId,
    Cookie,
    RoutingGroup,
}

impl RouteSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteSource::QueryId => "query_id",
            RouteSource::Cookie => "cookie",
            RouteSource::RoutingGroup => "routing_group",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingDestination {
    /// Backend name, or its url when the directory no longer knows it.
    pub backend: String,
    pub backend_url: String,
    /// Full uri the request is forwarded to.
    pub cluster_uri: Uri,
    pub routing_group: String,
    pub external_url: String,
}

/// Everything the forwarding layer needs for one request.
#[derive(Debug)]
pub struct RoutingTarget {
    pub destination: RoutingDestination,
    pub source: RouteSource,
    pub query_id: Option<String>,
    /// Selector supplied headers for the forwarded request.
    pub extra_headers: HeaderMap,
    /// `Set-Cookie` values removing stale cookies. Sent whatever the outcome.
    pub cookie_deletions: Vec<HeaderValue>,
    /// `Set-Cookie` values pinning the session to the destination.
    pub new_cookies: Vec<HeaderValue>,
    /// Present for new statement submissions.
    pub pending: Option<PendingSubmission>,
}

struct CookieRouting {
    signer: CookieSigner,
    families: Vec<CookieFamily>,
}

/// Resolves requests to backends: by query id, then by session cookie, then
/// by routing group.
pub struct RoutingEngine {
    extractor: QueryIdExtractor,
    cache: Arc<QueryCacheManager>,
    directory: Arc<dyn BackendDirectory>,
    selector: RoutingGroupSelector,
    cookies: Option<CookieRouting>,
    config: RoutingConfig,
    user_header: HeaderName,
    source_header: HeaderName,
    header_deny_list: Vec<HeaderName>,
    next_backend: AtomicUsize,
    probe_client: reqwest::Client,
}

impl RoutingEngine {
    pub fn new(
        config: &Config,
        cache: Arc<QueryCacheManager>,
        directory: Arc<dyn BackendDirectory>,
        selector: RoutingGroupSelector,
    ) -> Result<Self, BuildError> {
        let routing = config.routing.clone();
        let header_deny_list = routing
            .header_deny_list
            .iter()
            .map(|h| HeaderName::from_bytes(h.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let cookies = match (config.cookies.enabled, &config.cookies.signing_key) {
            (true, Some(key)) => Some(CookieRouting {
                signer: CookieSigner::new(key.as_bytes()),
                families: config.cookies.families.clone(),
            }),
            _ => None,
        };

        let probe_client = reqwest::Client::builder()
            .timeout(routing.probe_timeout())
            .build()?;

        Ok(Self {
            extractor: QueryIdExtractor::new(&config.statement_paths),
            cache,
            directory,
            selector,
            cookies,
            user_header: HeaderName::from_bytes(routing.user_header.as_bytes())?,
            source_header: HeaderName::from_bytes(routing.source_header.as_bytes())?,
            header_deny_list,
            config: routing,
            next_backend: AtomicUsize::new(0),
            probe_client,
        })
    }

    pub fn cache(&self) -> &Arc<QueryCacheManager> {
        &self.cache
    }

    pub async fn resolve(&self, ctx: &RequestContext) -> Result<RoutingTarget, RoutingError> {
        let path = ctx.path();
        let query_id = self
            .extractor
            .extract(&ctx.method, path, ctx.query(), &ctx.body);

        let evaluation = self.evaluate_cookies(ctx);
        let cookie_deletions = deletion_headers(&evaluation);

        if let Some(id) = &query_id
            && let Some(destination) = self.destination_for_query(ctx, id).await?
        {
            tracing::debug!(
                query_id = %id,
                backend = %destination.backend,
                "routing by query id"
            );
            return Ok(self.target(RouteSource::QueryId, destination, query_id, cookie_deletions));
        }

        let user = ctx.user(&self.user_header);
        let (source, destination, extra_headers) = match &evaluation.selected {
            Some(cookie) => {
                let destination = match self.directory.find_by_url(cookie.backend()) {
                    Some(backend) => self.destination(ctx, &backend, None)?,
                    None => unreachable_backend(ctx, cookie.backend(), &self.config)?,
                };
                tracing::debug!(
                    cookie = %cookie.cookie_name(),
                    backend = %destination.backend,
                    "routing by session cookie"
                );
                (RouteSource::Cookie, destination, HeaderMap::new())
            }
            None => {
                let (destination, headers) = self.select_by_group(ctx, user.as_deref()).await?;
                (RouteSource::RoutingGroup, destination, headers)
            }
        };

        let new_cookies = self.mint_cookies(path, &evaluation, &destination);

        let mut target = self.target(source, destination, query_id, cookie_deletions);
        target.extra_headers = extra_headers;
        target.new_cookies = new_cookies;

        if ctx.method == Method::POST
            && target.query_id.is_none()
            && self.extractor.is_statement_path(path)
        {
            let destination = &target.destination;
            target.pending = Some(PendingSubmission {
                backend_url: destination.backend_url.clone(),
                routing_group: destination.routing_group.clone(),
                external_url: destination.external_url.clone(),
                user,
                source: ctx.header_str(&self.source_header).map(String::from),
                query_text: truncate_query_text(&String::from_utf8_lossy(&ctx.body)),
            });
        }
        Ok(target)
    }

    fn target(
        &self,
        source: RouteSource,
        destination: RoutingDestination,
        query_id: Option<String>,
        cookie_deletions: Vec<HeaderValue>,
    ) -> RoutingTarget {
        counter!(ROUTING_DECISION, "source" => source.as_str()).increment(1);
        RoutingTarget {
            destination,
            source,
            query_id,
            extra_headers: HeaderMap::new(),
            cookie_deletions,
            new_cookies: Vec::new(),
            pending: None,
        }
    }

    /// `Set-Cookie` values removing the stale gateway cookies of `ctx`. Used
    /// for responses to requests that could not be routed.
    pub fn cookie_deletions(&self, ctx: &RequestContext) -> Vec<HeaderValue> {
        deletion_headers(&self.evaluate_cookies(ctx))
    }

    fn evaluate_cookies(&self, ctx: &RequestContext) -> CookieEvaluation {
        match &self.cookies {
            Some(cookies) => evaluate_cookies(&ctx.headers, ctx.path(), &cookies.signer, now_ms(), |b| {
                self.directory.find_by_url(b).is_some()
            }),
            None => CookieEvaluation::default(),
        }
    }

    /// New cookies for every family whose scope covers `path` and that the
    /// client holds no usable cookie for.
    fn mint_cookies(
        &self,
        path: &str,
        evaluation: &CookieEvaluation,
        destination: &RoutingDestination,
    ) -> Vec<HeaderValue> {
        let Some(cookies) = &self.cookies else {
            return Vec::new();
        };

        cookies
            .families
            .iter()
            .filter(|f| f.in_scope(path) && !evaluation.families.contains(&f.name))
            .filter_map(|family| {
                let claims = CookieClaims {
                    name: family.name.clone(),
                    backend: destination.backend_url.clone(),
                    routing_paths: family.routing_paths.clone(),
                    delete_paths: family.delete_paths.clone(),
                    priority: family.priority,
                    ttl_secs: family.ttl_secs,
                    ts: now_ms(),
                    payload: None,
                };
                match cookies.signer.sign(claims).and_then(|c| c.to_set_cookie()) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!(family = %family.name, error = %e, "could not create cookie");
                        None
                    }
                }
            })
            .collect()
    }

    async fn destination_for_query(
        &self,
        ctx: &RequestContext,
        query_id: &str,
    ) -> Result<Option<RoutingDestination>, RoutingError> {
        let backend_url = match self.cache.get(CacheField::Backend, query_id).await {
            Some(url) => url,
            None => match self.probe_backends(query_id).await {
                Some(url) => {
                    self.cache.set(CacheField::Backend, query_id, &url).await;
                    url
                }
                None => {
                    tracing::debug!(query_id, "no backend recorded for query");
                    return Ok(None);
                }
            },
        };

        let (routing_group, external_url) = tokio::join!(
            self.cache.get(CacheField::RoutingGroup, query_id),
            self.cache.get(CacheField::ExternalUrl, query_id),
        );

        // Queries stay on their backend even after it is deactivated.
        match self.directory.find_by_url(&backend_url) {
            Some(backend) => {
                let mut destination = self.destination(ctx, &backend, routing_group)?;
                if let Some(external_url) = external_url {
                    destination.external_url = external_url;
                }
                Ok(Some(destination))
            }
            None => {
                let mut destination = unreachable_backend(ctx, &backend_url, &self.config)?;
                if let Some(routing_group) = routing_group {
                    destination.routing_group = routing_group;
                }
                if let Some(external_url) = external_url {
                    destination.external_url = external_url;
                }
                Ok(Some(destination))
            }
        }
    }

    async fn select_by_group(
        &self,
        ctx: &RequestContext,
        user: Option<&str>,
    ) -> Result<(RoutingDestination, HeaderMap), RoutingError> {
        let decision = self.selector.select(ctx, user).await.inspect_err(|e| {
            counter!(ROUTING_FAILURE, "reason" => "selector").increment(1);
            tracing::warn!(error = %e, "routing group selection failed");
        })?;

        let default_group = &self.config.default_routing_group;
        let group = decision
            .routing_group
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| default_group.clone());
        let strict = decision.strict.unwrap_or(self.config.strict_routing);

        let mut backends = self.directory.active_backends(&group);
        if backends.is_empty() {
            if strict {
                counter!(ROUTING_FAILURE, "reason" => "strict").increment(1);
                return Err(RoutingError::NoActiveBackend(group));
            }
            if &group != default_group {
                tracing::info!(
                    routing_group = %group,
                    default_group = %default_group,
                    "no active backend in routing group, using default group"
                );
                backends = self.directory.active_backends(default_group);
            }
        }

        let Some(backend) = self.pick(backends) else {
            counter!(ROUTING_FAILURE, "reason" => "no_backend").increment(1);
            return Err(RoutingError::NoBackendAvailable(default_group.clone()));
        };

        let mut headers = decision.headers;
        for name in &self.header_deny_list {
            if headers.remove(name).is_some() {
                tracing::warn!(header = %name, "ignoring selector header on deny list");
            }
        }

        Ok((self.destination(ctx, &backend, None)?, headers))
    }

    fn pick(&self, mut backends: Vec<Backend>) -> Option<Backend> {
        if backends.is_empty() {
            return None;
        }
        let index = match self.config.backend_selection {
            BackendSelection::Random => rand::thread_rng().gen_range(0..backends.len()),
            BackendSelection::RoundRobin => {
                self.next_backend.fetch_add(1, Ordering::Relaxed) % backends.len()
            }
        };
        Some(backends.swap_remove(index))
    }

    fn destination(
        &self,
        ctx: &RequestContext,
        backend: &Backend,
        routing_group: Option<String>,
    ) -> Result<RoutingDestination, RoutingError> {
        Ok(RoutingDestination {
            backend: backend.name.clone(),
            backend_url: backend.url.clone(),
            cluster_uri: cluster_uri(&backend.url, &ctx.uri)?,
            routing_group: routing_group.unwrap_or_else(|| backend.routing_group.clone()),
            external_url: backend.external_url.clone(),
        })
    }

    /// Asks every backend whether it knows `query_id`. First positive answer wins.
    async fn probe_backends(&self, query_id: &str) -> Option<String> {
        if !self.config.probe_backends_on_miss {
            return None;
        }

        let mut probes = JoinSet::new();
        for backend in self.directory.all() {
            let client = self.probe_client.clone();
            let url = format!("{}/v1/query/{query_id}", backend.url);
            probes.spawn(async move {
                let found = client
                    .head(&url)
                    .send()
                    .await
                    .is_ok_and(|r| r.status().is_success());
                found.then_some(backend.url)
            });
        }

        while let Some(result) = probes.join_next().await {
            if let Ok(Some(url)) = result {
                counter!(BACKEND_PROBE, "result" => "found").increment(1);
                tracing::info!(query_id, backend = %url, "located query by probing backends");
                return Some(url);
            }
        }
        counter!(BACKEND_PROBE, "result" => "not_found").increment(1);
        None
    }
}

fn deletion_headers(evaluation: &CookieEvaluation) -> Vec<HeaderValue> {
    evaluation
        .deletions
        .iter()
        .filter_map(|name| AffinityCookie::deletion(name).ok())
        .collect()
}

/// Destination for a backend url the directory does not know.
fn unreachable_backend(
    ctx: &RequestContext,
    backend_url: &str,
    config: &RoutingConfig,
) -> Result<RoutingDestination, RoutingError> {
    Ok(RoutingDestination {
        backend: backend_url.to_string(),
        backend_url: backend_url.to_string(),
        cluster_uri: cluster_uri(backend_url, &ctx.uri)?,
        routing_group: config.default_routing_group.clone(),
        external_url: backend_url.to_string(),
    })
}

fn cluster_uri(backend_url: &str, uri: &Uri) -> Result<Uri, http::uri::InvalidUri> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{path_and_query}", backend_url.trim_end_matches('/')).parse()
}
