use crate::selector::SelectorDecision;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum RulesError {
    #[error("could not read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse rules file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule {0} sets an invalid header: {1}")]
    InvalidHeader(String, String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Rule {
    pub name: String,
    /// Rules are applied in ascending priority; later rules override earlier ones.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub r#match: Match,
    pub action: RuleAction,
}

/// Conditions a request must meet. Unset conditions always match.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Match {
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    pub method: Option<String>,
    pub user: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RuleAction {
    pub routing_group: Option<String>,
    pub strict: Option<bool>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

pub struct IncomingRequest<'a> {
    pub host: Option<&'a str>,
    pub path: &'a str,
    pub method: &'a str,
    pub user: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

impl Rule {
    fn matches(&self, request: &IncomingRequest) -> bool {
        let m = &self.r#match;

        if let Some(host) = &m.host
            && !request.host.is_some_and(|h| h.eq_ignore_ascii_case(host))
        {
            return false;
        }
        if let Some(prefix) = &m.path_prefix
            && !request.path.starts_with(prefix.as_str())
        {
            return false;
        }
        if let Some(method) = &m.method
            && !request.method.eq_ignore_ascii_case(method)
        {
            return false;
        }
        if let Some(user) = &m.user
            && request.user != Some(user.as_str())
        {
            return false;
        }
        m.headers.iter().all(|(name, expected)| {
            request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected)
        })
    }
}

/// Applies every matching rule in order and returns the combined decision.
pub fn evaluate(rules: &[Rule], request: &IncomingRequest) -> SelectorDecision {
    let mut decision = SelectorDecision::default();

    for rule in rules.iter().filter(|r| r.matches(request)) {
        tracing::trace!(rule = %rule.name, "routing rule matched");
        if let Some(group) = &rule.action.routing_group {
            decision.routing_group = Some(group.clone());
        }
        if rule.action.strict.is_some() {
            decision.strict = rule.action.strict;
        }
        for (name, value) in &rule.action.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                decision.headers.insert(name, value);
            }
        }
    }
    decision
}

pub fn parse_rules(contents: &str) -> Result<Vec<Rule>, RulesError> {
    let mut rules: Vec<Rule> = serde_yaml::from_str(contents)?;

    for rule in &rules {
        for (name, value) in &rule.action.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(RulesError::InvalidHeader(rule.name.clone(), name.clone()));
            }
        }
    }

    // stable: equal priorities keep file order
    rules.sort_by_key(|r| r.priority);
    Ok(rules)
}

struct LoadedRules {
    rules: Arc<Vec<Rule>>,
    loaded_at: Instant,
}

/// Rules read from a YAML file and re-read once `refresh` has passed.
/// A file that fails to load leaves the previous rules in place.
pub struct RulesEngine {
    path: PathBuf,
    refresh: Duration,
    loaded: RwLock<LoadedRules>,
    reloading: AtomicBool,
}

impl RulesEngine {
    pub async fn load(path: &Path, refresh: Duration) -> Result<Self, RulesError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let rules = parse_rules(&contents)?;
        tracing::info!(path = %path.display(), rules = rules.len(), "loaded routing rules");

        Ok(Self {
            path: path.to_path_buf(),
            refresh,
            loaded: RwLock::new(LoadedRules {
                rules: Arc::new(rules),
                loaded_at: Instant::now(),
            }),
            reloading: AtomicBool::new(false),
        })
    }

    pub async fn rules(&self) -> Arc<Vec<Rule>> {
        let (rules, stale) = {
            let loaded = self.loaded.read();
            (loaded.rules.clone(), loaded.loaded_at.elapsed() >= self.refresh)
        };
        if !stale || self.reloading.swap(true, Ordering::AcqRel) {
            return rules;
        }

        let result = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_rules(&contents),
            Err(e) => Err(e.into()),
        };

        let mut loaded = self.loaded.write();
        loaded.loaded_at = Instant::now();
        match result {
            Ok(new_rules) => loaded.rules = Arc::new(new_rules),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to reload routing rules, keeping previous rules"
            ),
        }
        let rules = loaded.rules.clone();
        drop(loaded);
        self.reloading.store(false, Ordering::Release);
        rules
    }

    pub async fn evaluate(&self, request: &IncomingRequest<'_>) -> SelectorDecision {
        evaluate(&self.rules().await, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RULES: &str = r#"
        - name: etl-user
          priority: 1
          match:
              user: etl-bot
          action:
              routing_group: etl
        - name: airflow
          priority: 0
          match:
              path_prefix: /v1/statement
              method: post
              headers:
                  X-Trino-Source: airflow
          action:
              routing_group: batch
              strict: true
              headers:
                  X-Trino-Client-Tags: airflow
        - name: internal-host
          priority: 5
          match:
              host: internal.example.com
          action:
              routing_group: internal
    "#;

    fn request<'a>(
        headers: &'a HeaderMap,
        user: Option<&'a str>,
        host: Option<&'a str>,
    ) -> IncomingRequest<'a> {
        IncomingRequest {
            host,
            path: "/v1/statement",
            method: "POST",
            user,
            headers,
        }
    }

    #[test]
    fn test_parse_sorts_by_priority() {
        let rules = parse_rules(RULES).unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["airflow", "etl-user", "internal-host"]);
    }

    #[test]
    fn test_evaluate() {
        let rules = parse_rules(RULES).unwrap();
        let mut headers = HeaderMap::new();

        let decision = evaluate(&rules, &request(&headers, None, None));
        assert_eq!(decision, SelectorDecision::default());

        headers.insert("x-trino-source", HeaderValue::from_static("airflow"));
        let decision = evaluate(&rules, &request(&headers, None, None));
        assert_eq!(decision.routing_group.as_deref(), Some("batch"));
        assert_eq!(decision.strict, Some(true));
        assert_eq!(decision.headers["x-trino-client-tags"], "airflow");

        // a later rule overrides the group but keeps earlier headers
        let decision = evaluate(&rules, &request(&headers, Some("etl-bot"), None));
        assert_eq!(decision.routing_group.as_deref(), Some("etl"));
        assert_eq!(decision.strict, Some(true));
        assert!(decision.headers.contains_key("x-trino-client-tags"));

        let empty = HeaderMap::new();
        let decision = evaluate(
            &rules,
            &request(&empty, None, Some("INTERNAL.example.com")),
        );
        assert_eq!(decision.routing_group.as_deref(), Some("internal"));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let rules = r#"
            - name: bad
              action:
                  headers:
                      "bad header": x
        "#;
        assert!(matches!(
            parse_rules(rules),
            Err(RulesError::InvalidHeader(..))
        ));
    }

    #[tokio::test]
    async fn test_reload_after_refresh() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{RULES}").unwrap();

        let engine = RulesEngine::load(file.path(), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(engine.rules().await.len(), 3);

        std::fs::write(
            file.path(),
            "- name: only\n  action:\n    routing_group: everything\n",
        )
        .unwrap();
        // not stale yet
        assert_eq!(engine.rules().await.len(), 3);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.rules().await.len(), 1);

        // a broken file keeps the last good rules
        std::fs::write(file.path(), "not: [valid").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let headers = HeaderMap::new();
        let decision = engine.evaluate(&request(&headers, None, None)).await;
        assert_eq!(decision.routing_group.as_deref(), Some("everything"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        assert!(matches!(
            RulesEngine::load(Path::new("/nonexistent/rules.yaml"), Duration::from_secs(1)).await,
            Err(RulesError::Io(_))
        ));
    }
}
