//! The final response shape returned for every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evidence::{Evidence, EvidencePayload, SourceKind};
use crate::state::AgentRecord;
use crate::timeline::Timeline;

/// Final verdict of the decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Answer,
    Refuse,
    RequestMoreData,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Answer => write!(f, "answer"),
            Decision::Refuse => write!(f, "refuse"),
            Decision::RequestMoreData => write!(f, "request_more_data"),
        }
    }
}

/// Wire view of one evidence item. Run-internal ids are not exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceView {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub metadata: EvidencePayload,
}

impl From<&Evidence> for EvidenceView {
    fn from(ev: &Evidence) -> Self {
        Self {
            content: ev.content.clone(),
            timestamp: ev.timestamp,
            confidence: ev.confidence,
            metadata: ev.payload.clone(),
        }
    }
}

/// Collected evidence grouped by source kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<EvidenceView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rag: Vec<EvidenceView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<EvidenceView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dashboards: Vec<EvidenceView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<EvidenceView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_enrichment: Vec<EvidenceView>,
}

impl EvidenceBundle {
    pub fn push(&mut self, ev: &Evidence) {
        let view = EvidenceView::from(ev);
        match ev.source() {
            SourceKind::Log => self.logs.push(view),
            SourceKind::Rag => self.rag.push(view),
            SourceKind::Metrics => self.metrics.push(view),
            SourceKind::Dashboard => self.dashboards.push(view),
            SourceKind::Image => self.images.push(view),
            SourceKind::ToolEnrichment => self.tool_enrichment.push(view),
        }
    }

    pub fn total(&self) -> usize {
        self.logs.len()
            + self.rag.len()
            + self.metrics.len()
            + self.dashboards.len()
            + self.images.len()
            + self.tool_enrichment.len()
    }
}

/// Wire view of one timeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub time: DateTime<Utc>,
    pub event: String,
    pub source: SourceKind,
    pub confidence: f64,
}

impl TimelineEntry {
    pub fn project(timeline: &Timeline) -> Vec<TimelineEntry> {
        timeline
            .events
            .iter()
            .map(|e| TimelineEntry {
                time: e.time,
                event: e.event.clone(),
                source: e.source,
                confidence: e.confidence,
            })
            .collect()
    }
}

/// A non-winning hypothesis, with the verifier's reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeHypothesis {
    pub hypothesis: String,
    pub why_less_likely: String,
}

/// The structured response produced for every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub analysis_id: String,
    pub status: Decision,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<EvidenceBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<TimelineEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_actions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_hypotheses: Option<Vec<AlternativeHypothesis>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_evidence: Option<Vec<String>>,
    pub processing_time_ms: u64,
    pub agent_history: Vec<AgentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidencePayload;

    #[test]
    fn bundle_groups_by_source() {
        let mut bundle = EvidenceBundle::default();
        bundle.push(&Evidence::new(
            "ERROR timeout in api-gateway",
            None,
            0.9,
            EvidencePayload::Log {
                service: Some("api-gateway".to_string()),
                level: Some("ERROR".to_string()),
                matched_terms: vec![],
                similarity: None,
            },
        ));
        bundle.push(&Evidence::new(
            "INC-2023-089: memory leak in connection pool",
            None,
            0.82,
            EvidencePayload::Rag {
                corpus: crate::evidence::RagCorpus::Incidents,
                document_id: "INC-2023-089".to_string(),
                similarity: 0.82,
            },
        ));
        assert_eq!(bundle.logs.len(), 1);
        assert_eq!(bundle.rag.len(), 1);
        assert_eq!(bundle.total(), 2);
    }

    #[test]
    fn decision_wire_format() {
        assert_eq!(
            serde_json::to_value(Decision::RequestMoreData).unwrap(),
            "request_more_data"
        );
    }
}
