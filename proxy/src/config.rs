use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty backend name")]
    EmptyBackendName,

    #[error("Duplicate backend name: {0}")]
    DuplicateBackend(String),

    #[error("Backend {0} has an unsupported url scheme")]
    UnsupportedScheme(String),

    #[error("Statement path must start with '/': {0}")]
    InvalidStatementPath(String),

    #[error("Invalid whitelist pattern {0}: {1}")]
    InvalidWhitelistPattern(String, String),

    #[error("Default routing group cannot be empty")]
    EmptyDefaultGroup,

    #[error("async_timeout_secs must be greater than 0")]
    InvalidTimeout,

    #[error("Cookies are enabled but no signing key is configured")]
    MissingSigningKey,

    #[error("Cookie family {0} has no routing paths")]
    EmptyCookieFamily(String),

    #[error("Invalid header name in {0}: {1}")]
    InvalidHeaderName(&'static str, String),

    #[error("Query cache: {0}")]
    QueryCache(#[from] query_cache::config::ValidationError),
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for client traffic
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Path prefixes of the statement protocol. `/v1/query` is always handled too.
    #[serde(default = "default_statement_paths")]
    pub statement_paths: Vec<String>,
    /// Extra regular expressions for paths that should be proxied.
    #[serde(default)]
    pub extra_whitelist_paths: Vec<String>,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub cookies: CookieConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub query_cache: query_cache::config::Config,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        for path in &self.statement_paths {
            if !path.starts_with('/') {
                return Err(ValidationError::InvalidStatementPath(path.clone()));
            }
        }
        for pattern in &self.extra_whitelist_paths {
            regex::Regex::new(pattern).map_err(|e| {
                ValidationError::InvalidWhitelistPattern(pattern.clone(), e.to_string())
            })?;
        }

        let mut backend_names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ValidationError::EmptyBackendName);
            }
            if !backend_names.insert(&backend.name) {
                return Err(ValidationError::DuplicateBackend(backend.name.clone()));
            }
            if backend.proxy_to.scheme() != "http" {
                return Err(ValidationError::UnsupportedScheme(backend.name.clone()));
            }
        }

        self.routing.validate()?;
        self.cookies.validate()?;
        self.selector.validate()?;
        self.query_cache.validate()?;
        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// How a backend is picked among the active members of a routing group.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    #[default]
    Random,
    RoundRobin,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Group used when the selector yields nothing or the selected group has
    /// no active backend.
    #[serde(default = "default_routing_group")]
    pub default_routing_group: String,
    /// Upper bound on a single forwarded request.
    #[serde(default = "default_async_timeout_secs")]
    pub async_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub add_x_forwarded_headers: bool,
    /// Fail requests for a group without active backends instead of falling
    /// back to the default group. Selectors may override this per request.
    #[serde(default)]
    pub strict_routing: bool,
    #[serde(default)]
    pub backend_selection: BackendSelection,
    /// Ask every backend whether it knows a query id that no cache tier has.
    #[serde(default)]
    pub probe_backends_on_miss: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Headers a selector is never allowed to set on the forwarded request.
    #[serde(default = "default_header_deny_list")]
    pub header_deny_list: Vec<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_user_header")]
    pub user_header: String,
    #[serde(default = "default_source_header")]
    pub source_header: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_routing_group: default_routing_group(),
            async_timeout_secs: default_async_timeout_secs(),
            add_x_forwarded_headers: true,
            strict_routing: false,
            backend_selection: BackendSelection::default(),
            probe_backends_on_miss: false,
            probe_timeout_ms: default_probe_timeout_ms(),
            header_deny_list: default_header_deny_list(),
            max_body_bytes: default_max_body_bytes(),
            user_header: default_user_header(),
            source_header: default_source_header(),
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.default_routing_group.is_empty() {
            return Err(ValidationError::EmptyDefaultGroup);
        }
        if self.async_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        for name in self
            .header_deny_list
            .iter()
            .chain([&self.user_header, &self.source_header])
        {
            validate_header_name("routing", name)?;
        }
        Ok(())
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_secs(self.async_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// A backend cluster.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    /// Where requests are forwarded to.
    pub proxy_to: Url,
    /// Address clients should see for this backend. Defaults to `proxy_to`.
    #[serde(default)]
    pub external_url: Option<Url>,
    #[serde(default = "default_routing_group")]
    pub routing_group: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CookieConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HMAC key for cookie signatures. Must be shared by all gateway instances.
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default = "default_cookie_families")]
    pub families: Vec<CookieFamily>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            signing_key: None,
            families: default_cookie_families(),
        }
    }
}

impl CookieConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.signing_key.as_deref().is_none_or(str::is_empty) {
            return Err(ValidationError::MissingSigningKey);
        }
        for family in &self.families {
            if family.routing_paths.is_empty() {
                return Err(ValidationError::EmptyCookieFamily(family.name.clone()));
            }
        }
        Ok(())
    }
}

/// A class of session cookie, e.g. one for the login flow and one for the UI.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CookieFamily {
    pub name: String,
    pub routing_paths: Vec<String>,
    /// Requests to these paths clear the cookie.
    #[serde(default)]
    pub delete_paths: Vec<String>,
    #[serde(default = "default_cookie_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub priority: i32,
}

impl CookieFamily {
    pub fn in_scope(&self, path: &str) -> bool {
        !self.delete_paths.iter().any(|p| p == path)
            && self.routing_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum SelectorConfig {
    /// Routing group taken verbatim from a request header.
    Header {
        #[serde(default = "default_routing_group_header")]
        header: String,
    },
    /// Routing group chosen by a YAML rules file.
    Rules {
        path: PathBuf,
        #[serde(default = "default_rules_refresh_secs")]
        refresh_secs: u64,
    },
    /// Routing group chosen by an external HTTP service.
    External {
        url: Url,
        /// Request headers not sent to the service.
        #[serde(default)]
        exclude_headers: Vec<String>,
        /// Surface service failures to the client instead of falling back.
        #[serde(default)]
        propagate_errors: bool,
        #[serde(default = "default_external_timeout_ms")]
        timeout_ms: u64,
        /// Header consulted when the service cannot be used.
        #[serde(default = "default_routing_group_header")]
        fallback_header: String,
    },
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig::Header {
            header: default_routing_group_header(),
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            SelectorConfig::Header { header } => validate_header_name("selector", header),
            SelectorConfig::Rules { .. } => Ok(()),
            SelectorConfig::External {
                exclude_headers,
                fallback_header,
                ..
            } => {
                for name in exclude_headers.iter().chain([fallback_header]) {
                    validate_header_name("selector", name)?;
                }
                Ok(())
            }
        }
    }
}

fn validate_header_name(section: &'static str, name: &str) -> Result<(), ValidationError> {
    http::HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidHeaderName(section, name.to_string()))
}

fn default_true() -> bool {
    true
}

fn default_statement_paths() -> Vec<String> {
    vec!["/v1/statement".into()]
}

fn default_routing_group() -> String {
    "adhoc".into()
}

fn default_async_timeout_secs() -> u64 {
    120
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_header_deny_list() -> Vec<String> {
    [
        "authorization",
        "proxy-authorization",
        "cookie",
        "set-cookie",
        "host",
        "content-length",
        "transfer-encoding",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_user_header() -> String {
    "X-Trino-User".into()
}

fn default_source_header() -> String {
    "X-Trino-Source".into()
}

fn default_routing_group_header() -> String {
    "X-Trino-Routing-Group".into()
}

fn default_cookie_families() -> Vec<CookieFamily> {
    vec![CookieFamily {
        name: "oauth2".into(),
        routing_paths: vec!["/oauth2".into()],
        delete_paths: vec!["/oauth2/logout".into()],
        ttl_secs: default_cookie_ttl_secs(),
        priority: 0,
    }]
}

fn default_cookie_ttl_secs() -> u64 {
    10 * 60
}

fn default_rules_refresh_secs() -> u64 {
    60
}

fn default_external_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        listener:
            host: 0.0.0.0
            port: 8080
        admin_listener:
            host: 127.0.0.1
            port: 8081
        backends:
            - name: adhoc-1
              proxy_to: http://adhoc-1.internal:8080
            - name: etl-1
              proxy_to: http://etl-1.internal:8080
              external_url: https://etl.example.com
              routing_group: etl
              active: false
    "#;

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.statement_paths, vec!["/v1/statement".to_string()]);
        assert_eq!(config.routing.default_routing_group, "adhoc");
        assert_eq!(config.routing.async_timeout(), Duration::from_secs(120));
        assert!(config.routing.add_x_forwarded_headers);
        assert!(!config.cookies.enabled);
        assert_eq!(config.cookies.families[0].name, "oauth2");
        assert_eq!(
            config.selector,
            SelectorConfig::Header {
                header: "X-Trino-Routing-Group".into()
            }
        );
        assert_eq!(config.backends[0].routing_group, "adhoc");
        assert!(config.backends[0].active);
        assert!(!config.backends[1].active);
    }

    #[test]
    fn test_selector_variants() {
        let rules: SelectorConfig =
            serde_yaml::from_str("type: rules\npath: /etc/gateway/rules.yaml\n").unwrap();
        assert_eq!(
            rules,
            SelectorConfig::Rules {
                path: "/etc/gateway/rules.yaml".into(),
                refresh_secs: 60
            }
        );

        let external: SelectorConfig = serde_yaml::from_str(
            "type: external\nurl: http://router.internal/route\npropagate_errors: true\n",
        )
        .unwrap();
        match external {
            SelectorConfig::External {
                propagate_errors,
                timeout_ms,
                ..
            } => {
                assert!(propagate_errors);
                assert_eq!(timeout_ms, 5_000);
            }
            other => panic!("unexpected selector {other:?}"),
        }
    }

    #[test]
    fn test_validation() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.backends[1].name = "adhoc-1".into();
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateBackend("adhoc-1".into()))
        );

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.cookies.enabled = true;
        assert_eq!(config.validate(), Err(ValidationError::MissingSigningKey));
        config.cookies.signing_key = Some("secret".into());
        assert!(config.validate().is_ok());

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.extra_whitelist_paths = vec!["/custom/(".into()];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidWhitelistPattern(..))
        ));

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));
    }

    #[test]
    fn test_cookie_family_scope() {
        let family = &default_cookie_families()[0];
        assert!(family.in_scope("/oauth2/callback"));
        assert!(!family.in_scope("/oauth2/logout"));
        assert!(!family.in_scope("/ui/"));
    }
}
