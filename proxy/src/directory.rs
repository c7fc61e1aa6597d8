use crate::config::BackendConfig;
use indexmap::IndexMap;
use parking_lot::RwLock;

/// A backend cluster as seen by the routing engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    /// Base url requests are forwarded to, without a trailing slash. Also the
    /// value recorded as a query's backend.
    pub url: String,
    pub external_url: String,
    pub routing_group: String,
    pub active: bool,
}

impl From<&BackendConfig> for Backend {
    fn from(config: &BackendConfig) -> Self {
        let url = config.proxy_to.as_str().trim_end_matches('/').to_string();
        let external_url = config
            .external_url
            .as_ref()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .unwrap_or_else(|| url.clone());
        Backend {
            name: config.name.clone(),
            url,
            external_url,
            routing_group: config.routing_group.clone(),
            active: config.active,
        }
    }
}

/// Read access to the set of backends. Activation is managed elsewhere; the
/// routing engine only ever reads.
pub trait BackendDirectory: Send + Sync {
    fn all(&self) -> Vec<Backend>;

    fn active_backends(&self, routing_group: &str) -> Vec<Backend> {
        self.all()
            .into_iter()
            .filter(|b| b.active && b.routing_group == routing_group)
            .collect()
    }

    fn find_by_url(&self, url: &str) -> Option<Backend> {
        let url = url.trim_end_matches('/');
        self.all().into_iter().find(|b| b.url == url)
    }

    fn has_active_backends(&self) -> bool {
        self.all().iter().any(|b| b.active)
    }
}

/// Directory populated from configuration, in configuration order.
pub struct StaticDirectory {
    backends: RwLock<IndexMap<String, Backend>>,
}

impl StaticDirectory {
    pub fn new(backends: impl IntoIterator<Item = Backend>) -> Self {
        let backends = backends.into_iter().map(|b| (b.name.clone(), b)).collect();
        Self {
            backends: RwLock::new(backends),
        }
    }

    pub fn from_config(config: &[BackendConfig]) -> Self {
        Self::new(config.iter().map(Backend::from))
    }

    /// Returns false if no backend is called `name`.
    #[cfg(test)]
    pub fn set_active(&self, name: &str, active: bool) -> bool {
        match self.backends.write().get_mut(name) {
            Some(backend) => {
                if backend.active != active {
                    tracing::info!(backend = name, active, "backend activation changed");
                }
                backend.active = active;
                true
            }
            None => false,
        }
    }
}

impl BackendDirectory for StaticDirectory {
    fn all(&self) -> Vec<Backend> {
        self.backends.read().values().cloned().collect()
    }

    fn active_backends(&self, routing_group: &str) -> Vec<Backend> {
        self.backends
            .read()
            .values()
            .filter(|b| b.active && b.routing_group == routing_group)
            .cloned()
            .collect()
    }

    fn find_by_url(&self, url: &str) -> Option<Backend> {
        let url = url.trim_end_matches('/');
        self.backends.read().values().find(|b| b.url == url).cloned()
    }
}
