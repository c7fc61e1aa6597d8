use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderMap, HeaderName};
use http::{Method, Uri, Version};
use std::net::SocketAddr;

/// A client request with its body fully buffered, so that the body can be
/// inspected during routing and still be forwarded.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// The user named by `user_header`, falling back to basic auth.
    pub fn user(&self, user_header: &HeaderName) -> Option<String> {
        if let Some(user) = self.header_str(user_header) {
            return Some(user.to_string());
        }

        let credentials = self
            .header_str(&AUTHORIZATION)?
            .strip_prefix("Basic ")?
            .trim();
        let decoded = STANDARD.decode(credentials).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, _) = decoded.split_once(':')?;
        (!user.is_empty()).then(|| user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn context(headers: &[(&str, &str)]) -> RequestContext {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestContext {
            method: Method::GET,
            uri: "/v1/statement?x=1".parse().unwrap(),
            version: Version::HTTP_11,
            headers: map,
            body: Bytes::new(),
            peer_addr: None,
        }
    }

    #[test]
    fn test_user() {
        let user_header = HeaderName::from_static("x-trino-user");

        let ctx = context(&[("X-Trino-User", "alice"), ("Authorization", "Basic Ym9iOnB3")]);
        assert_eq!(ctx.user(&user_header).as_deref(), Some("alice"));

        // bob:pw
        let ctx = context(&[("Authorization", "Basic Ym9iOnB3")]);
        assert_eq!(ctx.user(&user_header).as_deref(), Some("bob"));

        let ctx = context(&[("Authorization", "Bearer token")]);
        assert!(ctx.user(&user_header).is_none());
        assert_eq!(ctx.path(), "/v1/statement");
        assert_eq!(ctx.query(), Some("x=1"));
    }
}
