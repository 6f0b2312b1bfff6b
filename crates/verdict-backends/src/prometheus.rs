//! Prometheus-compatible metrics backend client.
//!
//! Speaks the standard HTTP JSON API: `/api/v1/query`,
//! `/api/v1/query_range`, `/api/v1/alerts`, `/api/v1/targets`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default timeout for metrics queries.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the metrics backend.
#[derive(Debug, Error)]
pub enum PrometheusError {
    #[error("failed to connect to metrics backend: {0}")]
    Connection(String),

    #[error("metrics query timed out")]
    Timeout,

    #[error("metrics backend rejected query: {0}")]
    BadQuery(String),

    #[error("metrics response malformed: {0}")]
    Malformed(String),

    #[error("metrics backend error (status {status}): {body}")]
    Status { status: u16, body: String },
}

impl PrometheusError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PrometheusError::Timeout
        } else {
            PrometheusError::Connection(e.to_string())
        }
    }
}

/// One sample from an instant query.
#[derive(Debug, Clone)]
pub struct InstantSample {
    pub metric: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One series from a range query.
#[derive(Debug, Clone)]
pub struct RangeSeries {
    pub metric: HashMap<String, String>,
    pub samples: Vec<(DateTime<Utc>, f64)>,
}

/// A currently firing (or pending) alert.
#[derive(Debug, Clone, Deserialize)]
pub struct FiringAlert {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub state: String,
    #[serde(rename = "activeAt", default)]
    pub active_at: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// An active scrape target and its health.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeTarget {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub health: String,
    #[serde(rename = "scrapeUrl", default)]
    pub scrape_url: String,
    #[serde(rename = "lastError", default)]
    pub last_error: String,
}

// Wire shapes of the Prometheus JSON API.

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    #[allow(dead_code)]
    result_type: String,
    result: Vec<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Option<Vec<(f64, String)>>,
}

#[derive(Debug, Deserialize)]
struct AlertsData {
    alerts: Vec<FiringAlert>,
}

#[derive(Debug, Deserialize)]
struct TargetsData {
    #[serde(rename = "activeTargets")]
    active_targets: Vec<ScrapeTarget>,
}

fn parse_sample(ts: f64, value: &str) -> Option<(DateTime<Utc>, f64)> {
    let parsed: f64 = value.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    let secs = ts.trunc() as i64;
    let nanos = ((ts.fract()) * 1e9) as u32;
    let time = Utc.timestamp_opt(secs, nanos).single()?;
    Some((time, parsed))
}

/// Client for a Prometheus-compatible HTTP API. Cheap to clone; safe
/// for concurrent use.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: String,
    client: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: &str) -> Result<Self, PrometheusError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, PrometheusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| PrometheusError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Execute an instant query.
    #[instrument(skip(self), fields(backend = "prometheus"))]
    pub async fn query(
        &self,
        expr: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstantSample>, PrometheusError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let mut params = vec![("query".to_string(), expr.to_string())];
        if let Some(t) = time {
            params.push(("time".to_string(), t.timestamp().to_string()));
        }

        let data: QueryData = self.get(&url, &params).await?;
        let samples = data
            .result
            .into_iter()
            .filter_map(|r| {
                let (ts, value) = r.value?;
                let (timestamp, value) = parse_sample(ts, &value)?;
                Some(InstantSample {
                    metric: r.metric,
                    timestamp,
                    value,
                })
            })
            .collect();
        Ok(samples)
    }

    /// Execute a range query with the given step in seconds.
    #[instrument(skip(self), fields(backend = "prometheus"))]
    pub async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<RangeSeries>, PrometheusError> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let params = vec![
            ("query".to_string(), expr.to_string()),
            ("start".to_string(), start.timestamp().to_string()),
            ("end".to_string(), end.timestamp().to_string()),
            ("step".to_string(), format!("{}s", step_secs)),
        ];

        let data: QueryData = self.get(&url, &params).await?;
        let series = data
            .result
            .into_iter()
            .map(|r| {
                let samples = r
                    .values
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(ts, v)| parse_sample(ts, &v))
                    .collect();
                RangeSeries {
                    metric: r.metric,
                    samples,
                }
            })
            .collect();
        Ok(series)
    }

    /// Currently firing alerts.
    #[instrument(skip(self), fields(backend = "prometheus"))]
    pub async fn alerts(&self) -> Result<Vec<FiringAlert>, PrometheusError> {
        let url = format!("{}/api/v1/alerts", self.base_url);
        let data: AlertsData = self.get(&url, &[]).await?;
        Ok(data.alerts)
    }

    /// Active scrape targets and their health.
    #[instrument(skip(self), fields(backend = "prometheus"))]
    pub async fn targets(&self) -> Result<Vec<ScrapeTarget>, PrometheusError> {
        let url = format!("{}/api/v1/targets", self.base_url);
        let data: TargetsData = self.get(&url, &[]).await?;
        Ok(data.active_targets)
    }

    /// Enumerate jobs with an `up` indicator, for auto-discovery.
    pub async fn discover_jobs(&self) -> Result<Vec<String>, PrometheusError> {
        let samples = self.query("up", None).await?;
        let mut jobs: Vec<String> = samples
            .into_iter()
            .filter_map(|s| s.metric.get("job").cloned())
            .collect();
        jobs.sort();
        jobs.dedup();
        Ok(jobs)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<T, PrometheusError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(PrometheusError::from_reqwest)?;

        let status = response.status().as_u16();
        match status {
            200 => {
                let envelope: ApiEnvelope<T> = response
                    .json()
                    .await
                    .map_err(|e| PrometheusError::Malformed(e.to_string()))?;
                if envelope.status != "success" {
                    let reason = envelope.error.unwrap_or_else(|| "unknown error".to_string());
                    warn!(reason = %reason, "metrics backend returned non-success status");
                    return Err(PrometheusError::BadQuery(reason));
                }
                envelope
                    .data
                    .ok_or_else(|| PrometheusError::Malformed("missing data field".to_string()))
            }
            400 => {
                let body = response.text().await.unwrap_or_default();
                Err(PrometheusError::BadQuery(body))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                debug!(status, body = %body, "metrics backend error");
                Err(PrometheusError::Status { status, body })
            }
        }
    }
}
