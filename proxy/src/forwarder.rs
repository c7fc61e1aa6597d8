//! Sends routed requests to their backend and records new queries.

use crate::context::RequestContext;
use crate::errors::RequestError;
use crate::headers::{ForwardedInfo, add_via_header, filter_hop_by_hop, prepare_upstream_headers};
use crate::metrics_defs::{QUERY_ID_MISSING, QUERY_RECORDED, UPSTREAM_ERROR};
use crate::pending::PendingSubmission;
use crate::routing::RoutingTarget;
use bytes::Bytes;
use http::StatusCode;
use http::header::SET_COOKIE;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use query_cache::{QueryCacheManager, QueryDetail};
use serde::Deserialize;
use shared::counter;
use shared::http::{ResponseBody, full_body};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// The part of a statement response the gateway reads.
#[derive(Deserialize)]
struct StatementResponse {
    id: Option<String>,
}

pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    cache: Arc<QueryCacheManager>,
    timeout: Duration,
    add_forwarded: bool,
    listener_port: u16,
}

impl Forwarder {
    pub fn new(
        cache: Arc<QueryCacheManager>,
        timeout: Duration,
        add_forwarded: bool,
        listener_port: u16,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(HttpConnector::new());

        Self {
            client,
            cache,
            timeout,
            add_forwarded,
            listener_port,
        }
    }

    /// Forwards `ctx` to the destination in `target`.
    ///
    /// The timeout covers the backend's response headers. For new statement
    /// submissions it also covers the response body, which is buffered to
    /// learn the query id. A submission that fails or is dropped before then
    /// records nothing.
    pub async fn forward(
        &self,
        ctx: RequestContext,
        target: RoutingTarget,
    ) -> Result<Response<ResponseBody>, RequestError> {
        let RoutingTarget {
            destination,
            extra_headers,
            cookie_deletions,
            new_cookies,
            pending,
            ..
        } = target;

        let forwarded = ForwardedInfo {
            client_ip: ctx.peer_addr.map(|addr| addr.ip()),
            host: ctx.uri.authority().map(|authority| authority.to_string()),
            port: self.listener_port,
        };
        let mut headers = ctx.headers;
        prepare_upstream_headers(&mut headers, ctx.version, &forwarded, self.add_forwarded);
        for (name, value) in &extra_headers {
            headers.insert(name, value.clone());
        }

        let mut request = Request::builder()
            .method(ctx.method)
            .uri(destination.cluster_uri.clone())
            .body(Full::new(ctx.body))?;
        *request.headers_mut() = headers;

        let deadline = Instant::now() + self.timeout;
        let response = timeout_at(deadline, self.client.request(request))
            .await
            .map_err(|_| self.timed_out(&destination.backend))?
            .map_err(|e| {
                counter!(UPSTREAM_ERROR, "kind" => "connect").increment(1);
                tracing::warn!(
                    backend = %destination.backend,
                    uri = %destination.cluster_uri,
                    error = %e,
                    "backend request failed"
                );
                RequestError::UpstreamRequestFailed(destination.backend.clone(), e.to_string())
            })?;

        let (mut parts, body) = response.into_parts();
        let version = parts.version;
        filter_hop_by_hop(&mut parts.headers, version);
        add_via_header(&mut parts.headers, version);
        for cookie in cookie_deletions.into_iter().chain(new_cookies) {
            parts.headers.append(SET_COOKIE, cookie);
        }

        let Some(pending) = pending else {
            return Ok(Response::from_parts(parts, body.boxed()));
        };

        let bytes = timeout_at(deadline, collect(body))
            .await
            .map_err(|_| self.timed_out(&destination.backend))?
            .map_err(|e| {
                RequestError::UpstreamRequestFailed(destination.backend.clone(), e.to_string())
            })?;

        if parts.status == StatusCode::OK {
            self.record_submission(pending, &bytes).await;
        } else {
            tracing::info!(
                backend = %destination.backend,
                status = %parts.status,
                "statement submission was not accepted"
            );
        }

        Ok(Response::from_parts(parts, full_body(bytes)))
    }

    fn timed_out(&self, backend: &str) -> RequestError {
        counter!(UPSTREAM_ERROR, "kind" => "timeout").increment(1);
        tracing::warn!(backend, timeout = ?self.timeout, "backend request timed out");
        RequestError::UpstreamTimeout {
            backend: backend.to_string(),
            secs: self.timeout.as_secs(),
        }
    }

    /// Writes the backend of a newly submitted query to L1 before the client
    /// sees the response, so that its first poll through this instance finds
    /// it. L2 and the history store are written in the background.
    async fn record_submission(&self, pending: PendingSubmission, body: &Bytes) {
        let query_id = match serde_json::from_slice::<StatementResponse>(body) {
            Ok(StatementResponse { id: Some(id) }) if !id.is_empty() => id,
            Ok(_) => {
                counter!(QUERY_ID_MISSING).increment(1);
                tracing::warn!("statement response has no query id");
                return;
            }
            Err(e) => {
                counter!(QUERY_ID_MISSING).increment(1);
                tracing::warn!(error = %e, "could not parse statement response");
                return;
            }
        };

        let detail = pending.complete(&query_id);
        let inserted = self.cache.set_local(&query_id, &detail.metadata()).await;
        counter!(QUERY_RECORDED).increment(1);
        tracing::debug!(query_id = %query_id, backend = %detail.backend_url, "recorded new query");

        let cache = self.cache.clone();
        tokio::spawn(async move {
            write_back(cache, detail, inserted).await;
        });
    }
}

async fn write_back(
    cache: Arc<QueryCacheManager>,
    detail: QueryDetail,
    inserted: query_cache::QueryMetadata,
) {
    if !inserted.is_empty() {
        cache.publish(&detail.query_id, &inserted).await;
    }
    if let Err(e) = cache.record(&detail).await {
        tracing::warn!(query_id = %detail.query_id, error = %e, "could not record query history");
    }
}

async fn collect(body: Incoming) -> Result<Bytes, hyper::Error> {
    Ok(body.collect().await?.to_bytes())
}
