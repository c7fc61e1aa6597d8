//! Which request paths belong to the query protocol.

use regex::Regex;

pub const V1_QUERY_PATH: &str = "/v1/query";
pub const V1_INFO_PATH: &str = "/v1/info";
pub const V1_NODE_PATH: &str = "/v1/node";
pub const UI_PATH: &str = "/ui";
pub const UI_API_STATS_PATH: &str = "/ui/api/stats";
pub const OAUTH_PATH: &str = "/oauth2";

/// Decides whether a request is proxied at all. Anything else never reaches
/// the routing engine.
pub struct PathFilter {
    prefixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl PathFilter {
    pub fn new(statement_paths: &[String], extra_patterns: &[String]) -> Result<Self, regex::Error> {
        let mut prefixes: Vec<String> = statement_paths.to_vec();
        prefixes.extend(
            [
                V1_QUERY_PATH,
                UI_PATH,
                V1_INFO_PATH,
                V1_NODE_PATH,
                UI_API_STATS_PATH,
                OAUTH_PATH,
            ]
            .map(String::from),
        );

        let patterns = extra_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { prefixes, patterns })
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || self.patterns.iter().any(|r| r.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_filter() {
        let filter = PathFilter::new(
            &["/v1/statement".to_string(), "/custom/statement".to_string()],
            &["^/api/v[0-9]+/queries".to_string()],
        )
        .unwrap();

        assert!(filter.is_allowed("/v1/statement"));
        assert!(filter.is_allowed("/v1/statement/queued/20240101_000000_00001_abcde/x/1"));
        assert!(filter.is_allowed("/custom/statement/executing/q/1"));
        assert!(filter.is_allowed("/v1/query/20240101_000000_00001_abcde"));
        assert!(filter.is_allowed("/ui/query.html"));
        assert!(filter.is_allowed("/oauth2/callback"));
        assert!(filter.is_allowed("/v1/info"));
        assert!(filter.is_allowed("/api/v2/queries"));

        assert!(!filter.is_allowed("/"));
        assert!(!filter.is_allowed("/entity/gateway_backend"));
        assert!(!filter.is_allowed("/api/queries"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(PathFilter::new(&[], &["(".to_string()]).is_err());
    }
}
