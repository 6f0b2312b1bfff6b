//! Grafana-compatible dashboard backend client.
//!
//! Speaks `/api/search`, `/api/dashboards/uid/{uid}`, and
//! `/api/annotations` with bearer-token authentication.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the dashboard backend.
#[derive(Debug, Error)]
pub enum GrafanaError {
    #[error("failed to connect to dashboard backend: {0}")]
    Connection(String),

    #[error("dashboard request timed out")]
    Timeout,

    #[error("dashboard backend authentication failed")]
    Authentication,

    #[error("dashboard {0} not found")]
    NotFound(String),

    #[error("dashboard response malformed: {0}")]
    Malformed(String),

    #[error("dashboard backend error (status {status}): {body}")]
    Status { status: u16, body: String },
}

impl GrafanaError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GrafanaError::Timeout
        } else {
            GrafanaError::Connection(e.to_string())
        }
    }
}

/// One dashboard search hit.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardHit {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A panel within a dashboard.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelSummary {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Full panel definitions for one dashboard.
#[derive(Debug, Clone)]
pub struct DashboardDetail {
    pub uid: String,
    pub title: String,
    pub panels: Vec<PanelSummary>,
}

/// An annotation within a time window. Times are epoch milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub id: Option<i64>,
    pub time: i64,
    #[serde(rename = "timeEnd", default)]
    pub time_end: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct DashboardEnvelope {
    dashboard: DashboardBody,
}

#[derive(Debug, Deserialize)]
struct DashboardBody {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    panels: Vec<PanelSummary>,
}

/// Client for a Grafana-compatible HTTP API. Safe for concurrent use.
#[derive(Debug, Clone)]
pub struct GrafanaClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GrafanaClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, GrafanaError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GrafanaError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Search dashboards by free-text query and/or tags.
    #[instrument(skip(self), fields(backend = "grafana"))]
    pub async fn search(
        &self,
        query: Option<&str>,
        tags: &[String],
    ) -> Result<Vec<DashboardHit>, GrafanaError> {
        let url = format!("{}/api/search", self.base_url);
        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(q) = query {
            params.push(("query".to_string(), q.to_string()));
        }
        for tag in tags {
            params.push(("tag".to_string(), tag.clone()));
        }

        let hits: Vec<DashboardHit> = self.get(&url, &params).await?;
        debug!(count = hits.len(), "dashboard search complete");
        Ok(hits)
    }

    /// Fetch one dashboard's panel definitions by uid.
    #[instrument(skip(self), fields(backend = "grafana"))]
    pub async fn dashboard(&self, uid: &str) -> Result<DashboardDetail, GrafanaError> {
        let url = format!("{}/api/dashboards/uid/{}", self.base_url, uid);
        let envelope: DashboardEnvelope = self.get(&url, &[]).await.map_err(|e| match e {
            GrafanaError::Status { status: 404, .. } => GrafanaError::NotFound(uid.to_string()),
            other => other,
        })?;

        Ok(DashboardDetail {
            uid: if envelope.dashboard.uid.is_empty() {
                uid.to_string()
            } else {
                envelope.dashboard.uid
            },
            title: envelope.dashboard.title,
            panels: envelope.dashboard.panels,
        })
    }

    /// Annotations within `[from_ms, to_ms]`, optionally filtered by tags.
    #[instrument(skip(self), fields(backend = "grafana"))]
    pub async fn annotations(
        &self,
        from_ms: i64,
        to_ms: i64,
        tags: &[String],
    ) -> Result<Vec<Annotation>, GrafanaError> {
        let url = format!("{}/api/annotations", self.base_url);
        let mut params = vec![
            ("from".to_string(), from_ms.to_string()),
            ("to".to_string(), to_ms.to_string()),
            ("limit".to_string(), "100".to_string()),
        ];
        for tag in tags {
            params.push(("tags".to_string(), tag.clone()));
        }

        self.get(&url, &params).await
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<T, GrafanaError> {
        let mut request = self.client.get(url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(GrafanaError::from_reqwest)?;

        match response.status().as_u16() {
            200 => response
                .json()
                .await
                .map_err(|e| GrafanaError::Malformed(e.to_string())),
            401 | 403 => Err(GrafanaError::Authentication),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(GrafanaError::Status { status, body })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_creation() {
        assert!(GrafanaClient::new("http://localhost:3000/", None).is_ok());
    }

    #[test]
    fn search_hit_deserialization() {
        let raw = r#"[{"uid": "abc123", "title": "API Overview", "tags": ["api-gateway"], "type": "dash-db"}]"#;
        let hits: Vec<DashboardHit> = serde_json::from_str(raw).unwrap();
        assert_eq!(hits[0].uid, "abc123");
        assert_eq!(hits[0].tags, vec!["api-gateway"]);
    }

    #[test]
    fn dashboard_envelope_deserialization() {
        let raw = r#"{
            "dashboard": {
                "uid": "abc123",
                "title": "API Overview",
                "panels": [{"id": 1, "title": "5xx rate", "type": "timeseries"}]
            },
            "meta": {"isStarred": false}
        }"#;
        let envelope: DashboardEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.dashboard.panels.len(), 1);
        assert_eq!(envelope.dashboard.panels[0].kind, "timeseries");
    }

    #[test]
    fn annotation_deserialization() {
        let raw = r#"[{"id": 7, "time": 1705329000000, "tags": ["deployment"], "text": "deploy v2.1.5"}]"#;
        let annotations: Vec<Annotation> = serde_json::from_str(raw).unwrap();
        assert_eq!(annotations[0].time, 1705329000000);
        assert_eq!(annotations[0].tags, vec!["deployment"]);
    }
}
