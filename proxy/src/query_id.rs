//! Locates the backend-assigned query id in a request.
//!
//! A query id looks like `20240101_123456_00042_abcde`: three groups of
//! digits and an alphanumeric suffix, separated by underscores.

use crate::paths::{UI_PATH, V1_QUERY_PATH};
use http::Method;

/// Path segments in the statement protocol that precede the query id.
const QUERY_STATES: &[&str] = &["queued", "scheduled", "executing", "partialCancel"];

/// Marker for statements that cancel another query.
const KILL_QUERY: &str = "kill_query";

pub struct QueryIdExtractor {
    /// Statement protocol prefixes, longest first, without trailing slashes.
    statement_paths: Vec<String>,
}

impl QueryIdExtractor {
    pub fn new(statement_paths: &[String]) -> Self {
        let mut paths: Vec<String> = statement_paths
            .iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .chain([V1_QUERY_PATH.to_string()])
            .filter(|p| !p.is_empty())
            .collect();
        paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        paths.dedup();
        Self {
            statement_paths: paths,
        }
    }

    /// Returns the query id the request refers to, if any.
    pub fn extract(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: &[u8],
    ) -> Option<String> {
        if method == Method::POST
            && let Some(id) = from_kill_statement(body)
        {
            return Some(id);
        }

        if let Some(remainder) = self.statement_remainder(path) {
            return from_statement_path(remainder);
        }

        query
            .and_then(from_query_string)
            .or_else(|| {
                path.starts_with(UI_PATH)
                    .then(|| from_ui_path(path))
                    .flatten()
            })
            .map(String::from)
    }

    /// Whether `path` is a statement protocol path (not `/v1/query`).
    pub fn is_statement_path(&self, path: &str) -> bool {
        self.statement_paths
            .iter()
            .filter(|p| p.as_str() != V1_QUERY_PATH)
            .any(|p| strip_path_prefix(path, p).is_some())
    }

    fn statement_remainder<'a>(&self, path: &'a str) -> Option<&'a str> {
        self.statement_paths
            .iter()
            .find_map(|prefix| strip_path_prefix(path, prefix))
    }
}

/// Strips `prefix` when it ends on a segment boundary of `path`.
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let remainder = path.strip_prefix(prefix)?;
    (remainder.is_empty() || remainder.starts_with('/')).then_some(remainder)
}

fn from_statement_path(remainder: &str) -> Option<String> {
    let mut segments = remainder.split('/').skip(1);
    let first = segments.next()?;
    let candidate = if QUERY_STATES.contains(&first) {
        segments.next()?
    } else {
        first
    };
    is_query_id(candidate).then(|| candidate.to_string())
}

fn from_ui_path(path: &str) -> Option<&str> {
    path.match_indices('/')
        .find_map(|(i, _)| query_id_prefix(&path[i + 1..]))
}

/// Matches an id at the start of the query string, after an encoded `/`, or
/// as the value of a `query_id` / `queryId` parameter. The last match wins.
fn from_query_string(query: &str) -> Option<&str> {
    let lower = query.to_ascii_lowercase();
    let mut starts = vec![0];
    for marker in ["query_id=", "queryid="] {
        starts.extend(lower.match_indices(marker).map(|(i, m)| i + m.len()));
    }
    starts.extend(query.match_indices("%2F").map(|(i, m)| i + m.len()));
    starts.sort_unstable();

    starts
        .into_iter()
        .rev()
        .find_map(|start| query_id_prefix(&query[start..]))
}

/// The id quoted in a `kill_query` call, e.g.
/// `CALL system.runtime.kill_query(query_id => '20240101_000000_00001_abcde')`.
fn from_kill_statement(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    if !text.to_ascii_lowercase().contains(KILL_QUERY) {
        return None;
    }
    // Every odd piece sits between single quotes
    text.split('\'')
        .skip(1)
        .step_by(2)
        .find(|literal| is_query_id(literal))
        .map(String::from)
}

pub fn is_query_id(s: &str) -> bool {
    query_id_prefix(s).is_some_and(|id| id.len() == s.len())
}

/// Returns the query id at the start of `s`, if it ends at a word boundary.
fn query_id_prefix(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let mut pos = 0;

    for _ in 0..3 {
        let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || bytes.get(pos + digits) != Some(&b'_') {
            return None;
        }
        pos += digits + 1;
    }

    let suffix = bytes[pos..]
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    if suffix == 0 {
        return None;
    }
    pos += suffix;

    match bytes.get(pos) {
        Some(b) if b.is_ascii_alphanumeric() || *b == b'_' => None,
        _ => Some(&s[..pos]),
    }
}
