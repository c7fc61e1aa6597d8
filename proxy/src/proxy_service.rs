use crate::context::RequestContext;
use crate::errors::RequestError;
use crate::forwarder::Forwarder;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::paths::PathFilter;
use crate::routing::RoutingEngine;
use http::HeaderValue;
use http::header::SET_COOKIE;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use shared::http::{PeerAddr, ResponseBody};
use shared::{gauge, histogram};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// The client facing service: admits whitelisted paths, buffers the body,
/// resolves a backend and forwards.
pub struct ProxyService {
    inner: Arc<Inner>,
}

struct Inner {
    path_filter: PathFilter,
    engine: Arc<RoutingEngine>,
    forwarder: Forwarder,
    max_body_bytes: usize,
}

impl ProxyService {
    pub fn new(
        path_filter: PathFilter,
        engine: Arc<RoutingEngine>,
        forwarder: Forwarder,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                path_filter,
                engine,
                forwarder,
                max_body_bytes,
            }),
        }
    }
}

/// A failed request and the stale cookies its error response still removes.
struct Failure {
    error: RequestError,
    set_cookies: Vec<HeaderValue>,
}

impl From<RequestError> for Failure {
    fn from(error: RequestError) -> Self {
        Self {
            error,
            set_cookies: Vec::new(),
        }
    }
}

impl Failure {
    fn with_cookies(error: RequestError, set_cookies: Vec<HeaderValue>) -> Self {
        Self { error, set_cookies }
    }

    fn into_response(self) -> Response<ResponseBody> {
        let mut response = self.error.into_response();
        for cookie in self.set_cookies {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        response
    }
}

impl Inner {
    async fn handle(&self, req: Request<Incoming>) -> Result<Response<ResponseBody>, Failure> {
        let path = req.uri().path();
        if !self.path_filter.is_allowed(path) {
            return Err(RequestError::PathNotAllowed(path.to_string()).into());
        }

        let peer_addr = req.extensions().get::<PeerAddr>().map(|p| p.0);
        let (parts, body) = req.into_parts();
        let body = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| match e.downcast_ref::<LengthLimitError>() {
                Some(_) => RequestError::BodyTooLarge(self.max_body_bytes),
                None => RequestError::Body(e.to_string()),
            })?
            .to_bytes();

        let ctx = RequestContext {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            peer_addr,
        };

        let target = match self.engine.resolve(&ctx).await {
            Ok(target) => target,
            Err(e) => {
                let deletions = self.engine.cookie_deletions(&ctx);
                return Err(Failure::with_cookies(e.into(), deletions));
            }
        };
        let deletions = target.cookie_deletions.clone();
        self.forwarder
            .forward(ctx, target)
            .await
            .map_err(|e| Failure::with_cookies(e, deletions))
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();

        Box::pin(async move {
            let start = Instant::now();
            gauge!(REQUESTS_INFLIGHT).increment(1.0);

            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let response = match inner.handle(req).await {
                Ok(response) => response,
                Err(failure) => {
                    match &failure.error {
                        RequestError::PathNotAllowed(_) => {
                            tracing::debug!(path = %path, "rejecting request for unknown path")
                        }
                        _ => tracing::warn!(
                            method = %method,
                            path = %path,
                            error = %failure.error,
                            "request failed"
                        ),
                    }
                    failure.into_response()
                }
            };

            gauge!(REQUESTS_INFLIGHT).decrement(1.0);
            histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_owned())
                .record(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}
