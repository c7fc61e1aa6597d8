//! Signed cookies that pin a browser session to a backend.
//!
//! The cookie value is the url-safe base64 encoding of a JSON document holding
//! the claims and an HMAC-SHA256 signature over the claims. Every gateway
//! instance shares the signing key, so any instance can honour a cookie
//! minted by another.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use http::header::{COOKIE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_PREFIX: &str = "TG.";
const DELETED_VALUE: &str = "delete";

#[derive(thiserror::Error, Debug)]
pub enum CookieError {
    #[error("not a gateway cookie: {0}")]
    NotGatewayCookie(String),
    #[error("cookie was deleted")]
    Deleted,
    #[error("cookie value is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("cookie value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cookie name does not match its claims")]
    NameMismatch,
    #[error("invalid signing key")]
    InvalidKey,
    #[error("cookie cannot be used as a header value")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieClaims {
    /// Family name, without [`COOKIE_PREFIX`].
    pub name: String,
    /// Url of the backend the session is pinned to.
    pub backend: String,
    pub routing_paths: Vec<String>,
    #[serde(default)]
    pub delete_paths: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub ttl_secs: u64,
    /// Creation time, milliseconds since the epoch.
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SignedClaims {
    #[serde(flatten)]
    claims: CookieClaims,
    signature: String,
}

#[derive(Clone)]
pub struct CookieSigner {
    key: Vec<u8>,
}

impl CookieSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self, claims: &CookieClaims) -> Result<HmacSha256, CookieError> {
        let json = serde_json::to_vec(claims)?;
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| CookieError::InvalidKey)?;
        mac.update(&json);
        Ok(mac)
    }

    pub fn sign(&self, claims: CookieClaims) -> Result<AffinityCookie, CookieError> {
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&claims)?.finalize().into_bytes());
        Ok(AffinityCookie { claims, signature })
    }

    pub fn verify(&self, cookie: &AffinityCookie) -> bool {
        let Ok(signature) = URL_SAFE_NO_PAD.decode(&cookie.signature) else {
            return false;
        };
        self.mac(&cookie.claims)
            .is_ok_and(|mac| mac.verify_slice(&signature).is_ok())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AffinityCookie {
    claims: CookieClaims,
    signature: String,
}

impl AffinityCookie {
    /// Decodes a cookie from its name and value as sent by the client.
    pub fn parse(name: &str, value: &str) -> Result<Self, CookieError> {
        let family = name
            .strip_prefix(COOKIE_PREFIX)
            .ok_or_else(|| CookieError::NotGatewayCookie(name.to_string()))?;
        if value == DELETED_VALUE {
            return Err(CookieError::Deleted);
        }

        let json = URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))?;
        let signed: SignedClaims = serde_json::from_slice(&json)?;
        if signed.claims.name != family {
            return Err(CookieError::NameMismatch);
        }
        Ok(Self {
            claims: signed.claims,
            signature: signed.signature,
        })
    }

    pub fn claims(&self) -> &CookieClaims {
        &self.claims
    }

    pub fn backend(&self) -> &str {
        &self.claims.backend
    }

    pub fn family(&self) -> &str {
        &self.claims.name
    }

    pub fn cookie_name(&self) -> String {
        format!("{COOKIE_PREFIX}{}", self.claims.name)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        let expires = self
            .claims
            .ts
            .saturating_add(self.claims.ttl_secs.saturating_mul(1000));
        now_ms >= expires
    }

    /// Signature checks out, not expired and names a backend.
    pub fn is_valid(&self, signer: &CookieSigner, now_ms: u64) -> bool {
        !self.claims.backend.is_empty() && !self.is_expired(now_ms) && signer.verify(self)
    }

    pub fn matches_delete_path(&self, path: &str) -> bool {
        self.claims.delete_paths.iter().any(|p| p == path)
    }

    pub fn matches_routing_path(&self, path: &str) -> bool {
        !self.matches_delete_path(path) && self.specificity(path).is_some()
    }

    /// Length of the longest routing path that prefixes `path`.
    fn specificity(&self, path: &str) -> Option<usize> {
        self.claims
            .routing_paths
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(String::len)
            .max()
    }

    /// Orders cookies so that the preferred one for `path` comes first: lower
    /// priority value, then the more specific path scope, then the newer one.
    pub fn preference(&self, other: &AffinityCookie, path: &str) -> Ordering {
        self.claims
            .priority
            .cmp(&other.claims.priority)
            .then_with(|| other.specificity(path).cmp(&self.specificity(path)))
            .then_with(|| other.claims.ts.cmp(&self.claims.ts))
    }

    pub fn encode_value(&self) -> Result<String, CookieError> {
        let signed = SignedClaims {
            claims: self.claims.clone(),
            signature: self.signature.clone(),
        };
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&signed)?))
    }

    pub fn to_set_cookie(&self) -> Result<HeaderValue, CookieError> {
        let value = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name(),
            self.encode_value()?,
            self.claims.ttl_secs
        );
        Ok(HeaderValue::from_str(&value)?)
    }

    /// A `Set-Cookie` value that makes the client drop cookie `name`.
    pub fn deletion(name: &str) -> Result<HeaderValue, CookieError> {
        Ok(HeaderValue::from_str(&format!(
            "{name}={DELETED_VALUE}; Path=/; Max-Age=0; HttpOnly; SameSite=Lax"
        ))?)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Gateway cookies in the `Cookie` headers, as `(name, value)` pairs.
pub fn request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| name.starts_with(COOKIE_PREFIX))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// What the cookies of one request amount to.
#[derive(Debug, Default)]
pub struct CookieEvaluation {
    /// The cookie the request should be routed by.
    pub selected: Option<AffinityCookie>,
    /// Cookies the client should drop.
    pub deletions: Vec<String>,
    /// Families with a usable cookie, whether or not it matched this path.
    pub families: HashSet<String>,
}

/// Sorts the gateway cookies of a request into the one to honour and the ones
/// to delete. A cookie is deleted when it is malformed, fails validation, is
/// sent to one of its delete paths or names a backend that `is_known_backend`
/// rejects.
pub fn evaluate_cookies(
    headers: &HeaderMap,
    path: &str,
    signer: &CookieSigner,
    now_ms: u64,
    is_known_backend: impl Fn(&str) -> bool,
) -> CookieEvaluation {
    let mut evaluation = CookieEvaluation::default();
    let mut candidates = Vec::new();

    for (name, value) in request_cookies(headers) {
        let cookie = match AffinityCookie::parse(&name, &value) {
            Ok(cookie) => cookie,
            Err(CookieError::Deleted) => continue,
            Err(e) => {
                tracing::debug!(cookie = %name, error = %e, "dropping malformed cookie");
                evaluation.deletions.push(name);
                continue;
            }
        };

        if !cookie.is_valid(signer, now_ms) {
            tracing::debug!(cookie = %name, "dropping invalid or expired cookie");
            evaluation.deletions.push(name);
        } else if cookie.matches_delete_path(path) {
            evaluation.deletions.push(name);
        } else if !is_known_backend(cookie.backend()) {
            tracing::info!(
                cookie = %name,
                backend = cookie.backend(),
                "dropping cookie for unknown backend"
            );
            evaluation.deletions.push(name);
        } else {
            evaluation.families.insert(cookie.family().to_string());
            if cookie.matches_routing_path(path) {
                candidates.push(cookie);
            }
        }
    }

    candidates.sort_by(|a, b| a.preference(b, path));
    evaluation.selected = candidates.into_iter().next();
    evaluation
}
