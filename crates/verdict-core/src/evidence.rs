//! Evidence: the typed, immutable observations produced by agents.
//!
//! An evidence item is a common header (content, timestamp, confidence)
//! plus a tagged payload carrying the kind-specific metadata of its
//! source. The set of source kinds is closed; downstream code matches
//! exhaustively instead of probing an open metadata bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of evidence source kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Log,
    Rag,
    Metrics,
    Dashboard,
    Image,
    ToolEnrichment,
}

impl SourceKind {
    /// All source kinds, in canonical order.
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Log,
        SourceKind::Rag,
        SourceKind::Metrics,
        SourceKind::Dashboard,
        SourceKind::Image,
        SourceKind::ToolEnrichment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Log => "log",
            SourceKind::Rag => "rag",
            SourceKind::Metrics => "metrics",
            SourceKind::Dashboard => "dashboard",
            SourceKind::Image => "image",
            SourceKind::ToolEnrichment => "tool_enrichment",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which RAG corpus a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RagCorpus {
    Incidents,
    Runbooks,
}

/// Whether dashboard evidence describes a dashboard or an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardItemKind {
    Dashboard,
    Annotation,
}

/// Summary statistics over a metric window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// Anomaly classification rules applied to a metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Point z-score above the configured threshold.
    ZScore { score: f64 },
    /// Series dropped to zero and stayed there.
    FlatlineToZero,
    /// Sustained level shift between window halves.
    StepChange { delta: f64 },
}

/// A detected anomaly within a metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAnomaly {
    pub time: DateTime<Utc>,
    pub value: f64,
    #[serde(flatten)]
    pub kind: AnomalyKind,
}

/// Kind-specific metadata, one variant per source kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EvidencePayload {
    Log {
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        level: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        matched_terms: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        similarity: Option<f64>,
    },
    Rag {
        corpus: RagCorpus,
        document_id: String,
        similarity: f64,
    },
    Metrics {
        metric: String,
        job: String,
        query: String,
        stats: MetricStats,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        anomalies: Vec<MetricAnomaly>,
    },
    Dashboard {
        #[serde(skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
        title: String,
        kind: DashboardItemKind,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    Image {
        image_ref: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        observed: Vec<String>,
    },
    ToolEnrichment {
        iterations: usize,
        tool_calls: usize,
        certainty: f64,
    },
}

impl EvidencePayload {
    /// The source kind this payload belongs to.
    pub fn source(&self) -> SourceKind {
        match self {
            EvidencePayload::Log { .. } => SourceKind::Log,
            EvidencePayload::Rag { .. } => SourceKind::Rag,
            EvidencePayload::Metrics { .. } => SourceKind::Metrics,
            EvidencePayload::Dashboard { .. } => SourceKind::Dashboard,
            EvidencePayload::Image { .. } => SourceKind::Image,
            EvidencePayload::ToolEnrichment { .. } => SourceKind::ToolEnrichment,
        }
    }
}

/// A single piece of evidence. Immutable once produced by its agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Unique identifier within the run.
    pub id: Uuid,
    /// Human-readable observation.
    pub content: String,
    /// Best available timestamp; None when the source carries no time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Kind-specific metadata.
    pub payload: EvidencePayload,
}

impl Evidence {
    pub fn new(
        content: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        confidence: f64,
        payload: EvidencePayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            timestamp,
            confidence: confidence.clamp(0.0, 1.0),
            payload,
        }
    }

    pub fn source(&self) -> SourceKind {
        self.payload.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        let ev = Evidence::new(
            "HTTP 500 errors starting",
            None,
            1.7,
            EvidencePayload::Log {
                service: Some("api-gateway".to_string()),
                level: Some("ERROR".to_string()),
                matched_terms: vec![],
                similarity: None,
            },
        );
        assert_eq!(ev.confidence, 1.0);
        assert_eq!(ev.source(), SourceKind::Log);
    }

    #[test]
    fn payload_roundtrips_with_source_tag() {
        let payload = EvidencePayload::Metrics {
            metric: "http_requests_5xx".to_string(),
            job: "api-gateway".to_string(),
            query: "rate(http_requests_total{status=\"5xx\"}[5m])".to_string(),
            stats: MetricStats {
                min: 0.0,
                max: 42.0,
                mean: 3.5,
                stddev: 9.1,
            },
            anomalies: vec![MetricAnomaly {
                time: Utc::now(),
                value: 42.0,
                kind: AnomalyKind::ZScore { score: 4.2 },
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["source"], "metrics");
        let back: EvidencePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.source(), SourceKind::Metrics);
    }

    #[test]
    fn source_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(SourceKind::ToolEnrichment).unwrap(),
            "tool_enrichment"
        );
        assert_eq!(SourceKind::ALL.len(), 6);
    }
}
