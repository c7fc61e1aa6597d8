// Header rewriting for forwarded traffic. Hop-by-hop filtering and the Via
// header apply in both directions; the rest only to requests sent to a backend.

use http::Version;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use std::net::IpAddr;

const PROXY_NAME: &str = "gateway";

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

pub fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Appends this proxy to the Via header.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::warn!(?version, "unknown HTTP version, skipping Via header");
            return;
        }
    };

    let via_value = format!("{version_str} {PROXY_NAME}");
    let combined = match headers.get(VIA).map(|v| v.to_str()) {
        Some(Ok(existing)) => format!("{existing}, {via_value}"),
        Some(Err(_)) => return,
        None => via_value,
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(VIA, value);
    }
}

// For HTTP/1.x connections, hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers
// - any extra headers listed in the Connection header value
// - keep-alive header for HTTP/0.9 and HTTP/1.0 only
//
// HTTP/2 and HTTP/3 don't use hop-by-hop headers, so no filtering is performed.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    let extra_drops: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }
    for name in extra_drops {
        headers.remove(&name);
    }

    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }

    headers
}

/// Where the client request came from, for the X-Forwarded-* headers.
#[derive(Clone, Debug, Default)]
pub struct ForwardedInfo {
    pub client_ip: Option<IpAddr>,
    /// Authority of the request target. HTTP/2 clients send no `Host` header.
    pub host: Option<String>,
    pub port: u16,
}

/// Rewrites client headers into the headers sent to a backend.
///
/// Client supplied `X-Forwarded-*` headers are only kept when
/// `add_forwarded` is set, in which case the gateway extends them.
pub fn prepare_upstream_headers(
    headers: &mut HeaderMap,
    version: Version,
    forwarded: &ForwardedInfo,
    add_forwarded: bool,
) {
    let host = forwarded.host.clone().or_else(|| {
        headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });

    filter_hop_by_hop(headers, version);
    headers.remove(ACCEPT_ENCODING);
    headers.remove(HOST);

    if !add_forwarded {
        for name in [
            &X_FORWARDED_FOR,
            &X_FORWARDED_PROTO,
            &X_FORWARDED_HOST,
            &X_FORWARDED_PORT,
        ] {
            headers.remove(name);
        }
    } else {
        if let Some(ip) = forwarded.client_ip {
            let value = match headers.get(&X_FORWARDED_FOR).map(|v| v.to_str()) {
                Some(Ok(existing)) => format!("{existing}, {ip}"),
                _ => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }
        if let Some(host) = host
            && !headers.contains_key(&X_FORWARDED_HOST)
            && let Ok(value) = HeaderValue::from_str(&host)
        {
            headers.insert(X_FORWARDED_HOST, value);
        }
        if !headers.contains_key(&X_FORWARDED_PORT) {
            headers.insert(X_FORWARDED_PORT, HeaderValue::from(forwarded.port));
        }
    }

    add_via_header(headers, version);
}
