//! Choosing a routing group for requests that are not pinned to a backend.

use crate::config::SelectorConfig;
use crate::context::RequestContext;
use crate::rules_engine::{IncomingRequest, RulesEngine, RulesError};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum SelectorError {
    #[error("routing rules error: {0}")]
    Rules(#[from] RulesError),
    #[error("routing service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("routing service rejected the request: {}", .0.join(", "))]
    Rejected(Vec<String>),
    #[error("invalid header name: {0}")]
    InvalidHeader(String),
}

/// Output of a selector. Every part is optional.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectorDecision {
    pub routing_group: Option<String>,
    /// Headers to add to the forwarded request.
    pub headers: HeaderMap,
    /// Overrides the configured strict routing mode for this request.
    pub strict: Option<bool>,
}

impl SelectorDecision {
    fn with_group(routing_group: Option<String>) -> Self {
        Self {
            routing_group,
            ..Default::default()
        }
    }
}

pub enum RoutingGroupSelector {
    Header(HeaderName),
    Rules(RulesEngine),
    External(ExternalSelector),
}

impl RoutingGroupSelector {
    pub async fn from_config(config: &SelectorConfig) -> Result<Self, SelectorError> {
        Ok(match config {
            SelectorConfig::Header { header } => {
                RoutingGroupSelector::Header(parse_header_name(header)?)
            }
            SelectorConfig::Rules { path, refresh_secs } => RoutingGroupSelector::Rules(
                RulesEngine::load(path, Duration::from_secs(*refresh_secs)).await?,
            ),
            SelectorConfig::External {
                url,
                exclude_headers,
                propagate_errors,
                timeout_ms,
                fallback_header,
            } => {
                let mut excluded = vec![CONTENT_LENGTH];
                for name in exclude_headers {
                    excluded.push(parse_header_name(name)?);
                }
                RoutingGroupSelector::External(ExternalSelector {
                    client: reqwest::Client::builder()
                        .timeout(Duration::from_millis(*timeout_ms))
                        .build()?,
                    url: url.clone(),
                    exclude_headers: excluded,
                    propagate_errors: *propagate_errors,
                    fallback_header: parse_header_name(fallback_header)?,
                })
            }
        })
    }

    pub async fn select(
        &self,
        ctx: &RequestContext,
        user: Option<&str>,
    ) -> Result<SelectorDecision, SelectorError> {
        match self {
            RoutingGroupSelector::Header(header) => Ok(SelectorDecision::with_group(
                ctx.header_str(header).map(String::from),
            )),
            RoutingGroupSelector::Rules(engine) => {
                let method = ctx.method.as_str();
                let request = IncomingRequest {
                    host: ctx.header_str(&HOST).or_else(|| ctx.uri.host()),
                    path: ctx.path(),
                    method,
                    user,
                    headers: &ctx.headers,
                };
                Ok(engine.evaluate(&request).await)
            }
            RoutingGroupSelector::External(external) => external.select(ctx, user).await,
        }
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName, SelectorError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| SelectorError::InvalidHeader(name.into()))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExternalRoutingRequest<'a> {
    method: &'a str,
    request_uri: &'a str,
    query_string: Option<&'a str>,
    content_type: Option<&'a str>,
    user: Option<&'a str>,
    remote_addr: Option<String>,
    headers: IndexMap<&'a str, Vec<&'a str>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ExternalRoutingResponse {
    routing_group: Option<String>,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    external_headers: IndexMap<String, String>,
    strict_routing: Option<bool>,
}

/// Delegates the decision to an HTTP service. The request metadata is POSTed
/// as JSON; the service answers with a routing group and optional headers.
pub struct ExternalSelector {
    client: reqwest::Client,
    url: url::Url,
    exclude_headers: Vec<HeaderName>,
    propagate_errors: bool,
    fallback_header: HeaderName,
}

impl ExternalSelector {
    async fn select(
        &self,
        ctx: &RequestContext,
        user: Option<&str>,
    ) -> Result<SelectorDecision, SelectorError> {
        match self.call(ctx, user).await {
            Ok(decision) => Ok(decision),
            Err(e) if self.propagate_errors => Err(e),
            Err(e) => {
                tracing::warn!(
                    url = %self.url,
                    error = %e,
                    "routing service failed, falling back to routing group header"
                );
                Ok(SelectorDecision::with_group(
                    ctx.header_str(&self.fallback_header).map(String::from),
                ))
            }
        }
    }

    async fn call(
        &self,
        ctx: &RequestContext,
        user: Option<&str>,
    ) -> Result<SelectorDecision, SelectorError> {
        let mut headers: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for (name, value) in &ctx.headers {
            if self.exclude_headers.contains(name) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.entry(name.as_str()).or_default().push(value);
            }
        }

        let body = ExternalRoutingRequest {
            method: ctx.method.as_str(),
            request_uri: ctx.path(),
            query_string: ctx.query(),
            content_type: ctx.header_str(&CONTENT_TYPE),
            user,
            remote_addr: ctx.peer_addr.map(|a| a.ip().to_string()),
            headers,
        };

        let response: ExternalRoutingResponse = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.errors.is_empty() {
            return Err(SelectorError::Rejected(response.errors));
        }

        let mut decision = SelectorDecision::with_group(response.routing_group);
        decision.strict = response.strict_routing;
        for (name, value) in response.external_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    decision.headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "routing service returned an invalid header"),
            }
        }
        Ok(decision)
    }
}
