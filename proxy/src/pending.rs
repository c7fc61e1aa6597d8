//! Statement submissions whose query id is not known yet.
//!
//! A new statement is routed before the backend assigns it an id. The routing
//! decision travels with the request as a [`PendingSubmission`] and becomes a
//! history record once the response names the query. A request that fails, times
//! out or is cancelled drops its submission along with everything else it owns.

use query_cache::QueryDetail;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSubmission {
    pub backend_url: String,
    pub routing_group: String,
    pub external_url: String,
    pub user: Option<String>,
    pub source: Option<String>,
    pub query_text: String,
}

impl PendingSubmission {
    /// The history record for this submission now that the backend named it
    /// `query_id`.
    pub fn complete(self, query_id: &str) -> QueryDetail {
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        QueryDetail {
            query_id: query_id.to_string(),
            query_text: self.query_text,
            backend_url: self.backend_url,
            user: self.user,
            source: self.source,
            routing_group: Some(self.routing_group),
            external_url: Some(self.external_url),
            captured_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete() {
        let submission = PendingSubmission {
            backend_url: "http://a:8080".into(),
            routing_group: "adhoc".into(),
            external_url: "https://a.example.com".into(),
            user: Some("alice".into()),
            source: None,
            query_text: "select 1".into(),
        };

        let detail = submission.complete("20240101_000000_00001_abcde");
        assert_eq!(detail.query_id, "20240101_000000_00001_abcde");
        assert_eq!(detail.backend_url, "http://a:8080");
        assert_eq!(detail.routing_group.as_deref(), Some("adhoc"));
        assert_eq!(detail.external_url.as_deref(), Some("https://a.example.com"));
        assert_eq!(detail.user.as_deref(), Some("alice"));
        assert!(detail.captured_at_ms > 0);
    }
}
