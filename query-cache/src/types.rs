use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest query text kept in a history record.
pub const MAX_QUERY_TEXT_LEN: usize = 200;

/// A single cached attribute of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheField {
    Backend,
    RoutingGroup,
    ExternalUrl,
}

impl CacheField {
    pub const ALL: [CacheField; 3] = [
        CacheField::Backend,
        CacheField::RoutingGroup,
        CacheField::ExternalUrl,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            CacheField::Backend => "backend",
            CacheField::RoutingGroup => "routing_group",
            CacheField::ExternalUrl => "external_url",
        }
    }
}

impl fmt::Display for CacheField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about where a query lives. Any field may be unset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub backend: Option<String>,
    pub routing_group: Option<String>,
    pub external_url: Option<String>,
}

impl QueryMetadata {
    pub fn new(
        backend: Option<String>,
        routing_group: Option<String>,
        external_url: Option<String>,
    ) -> Self {
        Self {
            backend: non_empty(backend),
            routing_group: non_empty(routing_group),
            external_url: non_empty(external_url),
        }
    }

    pub fn with_backend(backend: impl Into<String>) -> Self {
        Self::new(Some(backend.into()), None, None)
    }

    pub fn with_routing_group(routing_group: impl Into<String>) -> Self {
        Self::new(None, Some(routing_group.into()), None)
    }

    pub fn with_external_url(external_url: impl Into<String>) -> Self {
        Self::new(None, None, Some(external_url.into()))
    }

    pub fn get(&self, field: CacheField) -> Option<&str> {
        match field {
            CacheField::Backend => self.backend.as_deref(),
            CacheField::RoutingGroup => self.routing_group.as_deref(),
            CacheField::ExternalUrl => self.external_url.as_deref(),
        }
    }

    pub fn set(&mut self, field: CacheField, value: Option<String>) {
        let value = non_empty(value);
        match field {
            CacheField::Backend => self.backend = value,
            CacheField::RoutingGroup => self.routing_group = value,
            CacheField::ExternalUrl => self.external_url = value,
        }
    }

    /// Returns a copy where every field set in `other` replaces ours.
    pub fn merge(&self, other: &QueryMetadata) -> QueryMetadata {
        QueryMetadata {
            backend: other.backend.clone().or_else(|| self.backend.clone()),
            routing_group: other
                .routing_group
                .clone()
                .or_else(|| self.routing_group.clone()),
            external_url: other
                .external_url
                .clone()
                .or_else(|| self.external_url.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        CacheField::ALL.iter().all(|f| self.get(*f).is_none())
    }

    pub fn is_complete(&self) -> bool {
        CacheField::ALL.iter().all(|f| self.get(*f).is_some())
    }

    /// The fields that are set, in [`CacheField::ALL`] order.
    pub fn fields(&self) -> impl Iterator<Item = (CacheField, &str)> {
        CacheField::ALL
            .into_iter()
            .filter_map(|f| self.get(f).map(|v| (f, v)))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// A submitted query as recorded in the history store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDetail {
    pub query_id: String,
    pub query_text: String,
    pub backend_url: String,
    pub user: Option<String>,
    pub source: Option<String>,
    pub routing_group: Option<String>,
    pub external_url: Option<String>,
    pub captured_at_ms: i64,
}

impl QueryDetail {
    pub fn metadata(&self) -> QueryMetadata {
        QueryMetadata::new(
            Some(self.backend_url.clone()),
            self.routing_group.clone(),
            self.external_url.clone(),
        )
    }
}

/// Cuts `text` to at most [`MAX_QUERY_TEXT_LEN`] bytes on a char boundary.
pub fn truncate_query_text(text: &str) -> String {
    if text.len() <= MAX_QUERY_TEXT_LEN {
        return text.to_string();
    }
    let mut end = MAX_QUERY_TEXT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
