use crate::routing::RoutingError;
use crate::selector::SelectorError;
use http::StatusCode;
use hyper::Response;
use shared::http::{ResponseBody, make_error_response, make_error_response_with_message};
use std::io;

/// Errors that stop the gateway from starting or keep it from serving.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ValidationError),
    #[error("could not build routing group selector: {0}")]
    Selector(#[from] SelectorError),
    #[error("could not build query cache: {0}")]
    QueryCache(#[from] query_cache::manager::BuildError),
    #[error("could not build routing engine: {0}")]
    Routing(#[from] crate::routing::BuildError),
    #[error("invalid whitelist pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors raised while handling a single request. Each one becomes a response.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("path not allowed: {0}")]
    PathNotAllowed(String),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("could not read request body: {0}")]
    Body(String),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("request to {backend} timed out after {secs}s")]
    UpstreamTimeout { backend: String, secs: u64 },
    #[error("request to {0} failed: {1}")]
    UpstreamRequestFailed(String, String),
    #[error("could not build upstream request: {0}")]
    InvalidUpstreamRequest(#[from] http::Error),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::PathNotAllowed(_) => StatusCode::NOT_FOUND,
            RequestError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RequestError::Body(_) => StatusCode::BAD_REQUEST,
            RequestError::Routing(e) => match e {
                RoutingError::NoActiveBackend(_) => StatusCode::NOT_FOUND,
                RoutingError::NoBackendAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                RoutingError::Selector(SelectorError::Rejected(_)) => StatusCode::BAD_REQUEST,
                RoutingError::Selector(_) => StatusCode::BAD_GATEWAY,
                RoutingError::InvalidUri(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RequestError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RequestError::UpstreamRequestFailed(..) => StatusCode::BAD_GATEWAY,
            RequestError::InvalidUpstreamRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<ResponseBody> {
        let status = self.status();
        match self {
            RequestError::UpstreamTimeout { secs, .. } => make_error_response_with_message(
                status,
                format!("Request to backend timed out after {secs}s\n"),
            ),
            RequestError::Routing(
                e @ (RoutingError::NoActiveBackend(_) | RoutingError::Selector(_)),
            ) => make_error_response_with_message(status, format!("{e}\n")),
            _ => make_error_response(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_timeout_response() {
        let response = RequestError::UpstreamTimeout {
            backend: "adhoc-1".into(),
            secs: 120,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            body(response).await,
            "Request to backend timed out after 120s\n"
        );
    }

    #[tokio::test]
    async fn test_routing_responses() {
        let response =
            RequestError::Routing(RoutingError::NoActiveBackend("etl".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body(response).await,
            "no active backend for routing group etl\n"
        );

        let rejected = RoutingError::Selector(SelectorError::Rejected(vec!["bad user".into()]));
        assert_eq!(
            RequestError::Routing(rejected).status(),
            StatusCode::BAD_REQUEST
        );

        let response =
            RequestError::Routing(RoutingError::NoBackendAvailable("adhoc".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(response).await, "Service Unavailable\n");
    }

    #[test]
    fn test_upstream_failure_status() {
        let err = RequestError::UpstreamRequestFailed("adhoc-1".into(), "refused".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RequestError::BodyTooLarge(10).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
