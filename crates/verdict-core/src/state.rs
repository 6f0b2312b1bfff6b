//! The per-run state record.
//!
//! The orchestrator exclusively owns a [`RunState`]. Agents receive
//! immutable snapshots and return additive [`EvidencePatch`]es; patches
//! are applied serially at stage boundaries, so no agent ever observes
//! another agent's partial output.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Stage, StageStatus};
use crate::evidence::{Evidence, SourceKind};
use crate::hypothesis::{Hypothesis, Verdict, VerificationResult};
use crate::plan::Plan;
use crate::response::AnalysisResponse;
use crate::timeline::Timeline;

// =============================================================================
// REQUEST
// =============================================================================

/// One log entry attached to the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Originating service. Accepts `source` as a wire alias.
    #[serde(default, alias = "source", skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Log line text. Accepts either `message` or `content` on the wire.
    #[serde(alias = "content")]
    pub message: String,
}

/// A base64-encoded log file attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFile {
    pub filename: String,
    pub content_base64: String,
}

/// The incident analysis request as received on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAnalysisRequest {
    pub query: String,
    /// ISO-8601 incident timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Dashboard screenshots: base64 payloads or file paths.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dashboard_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_files_base64: Vec<LogFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    /// Affected-service hints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// A normalized, validated request. Times are UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub dashboard_images: Vec<String>,
    pub log_files: Vec<LogFile>,
    pub logs: Vec<LogEntry>,
    pub services: Vec<String>,
}

impl AnalysisRequest {
    /// Normalize a wire request. Fails synchronously on malformed input,
    /// before the pipeline starts.
    pub fn from_raw(raw: RawAnalysisRequest) -> Result<Self> {
        if raw.query.trim().is_empty() {
            return Err(Error::invalid_request("query must not be empty"));
        }

        let timestamp = match &raw.timestamp {
            Some(ts) => ts
                .parse::<DateTime<Utc>>()
                .or_else(|_| {
                    DateTime::parse_from_rfc3339(ts).map(|t| t.with_timezone(&Utc))
                })
                .map_err(|_| {
                    Error::invalid_request(format!("timestamp {:?} is not ISO-8601", ts))
                })?,
            None => return Err(Error::invalid_request("timestamp is required")),
        };

        let services = raw
            .services
            .into_iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            query: raw.query.trim().to_string(),
            timestamp,
            dashboard_images: raw.dashboard_images,
            log_files: raw.log_files_base64,
            logs: raw.logs,
            services,
        })
    }

    /// SHA-256 hash of the normalized request, recorded for auditability.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let json = serde_json::to_string(self).unwrap_or_default();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// =============================================================================
// AGENT HISTORY
// =============================================================================

/// Per-stage outcome recorded into the run's chronological history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    #[serde(rename = "agent")]
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Tool-loop iterations, present for enrichment records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentRecord {
    pub fn new(stage: Stage, status: StageStatus, started_at: DateTime<Utc>) -> Self {
        let duration = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        Self {
            stage,
            status,
            started_at,
            duration_ms: duration,
            evidence_count: None,
            confidence: None,
            iterations: None,
            error: None,
        }
    }

    pub fn with_evidence_count(mut self, count: usize) -> Self {
        self.evidence_count = Some(count);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// =============================================================================
// PATCHES
// =============================================================================

/// The additive result of one evidence agent. Agents only append; they
/// never see or modify shared state.
#[derive(Debug, Clone, Default)]
pub struct EvidencePatch {
    pub evidence: Vec<Evidence>,
    /// Non-fatal errors encountered while collecting.
    pub errors: Vec<String>,
}

impl EvidencePatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            evidence: Vec::new(),
            errors: vec![error.into()],
        }
    }
}

// =============================================================================
// RUN STATE
// =============================================================================

/// The orchestrator's shared record for one run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub analysis_id: Uuid,
    pub request: AnalysisRequest,
    pub input_hash: String,
    pub started_at: DateTime<Utc>,

    pub plan: Option<Plan>,
    pub evidence: BTreeMap<SourceKind, Vec<Evidence>>,
    pub timeline: Timeline,
    pub hypotheses: Vec<Hypothesis>,
    pub verifications: Vec<VerificationResult>,
    pub overall_confidence: f64,

    pub response: Option<AnalysisResponse>,
    pub agent_history: Vec<AgentRecord>,
    pub errors: Vec<String>,
}

impl RunState {
    pub fn new(request: AnalysisRequest) -> Self {
        let input_hash = request.compute_hash();
        Self {
            analysis_id: Uuid::new_v4(),
            request,
            input_hash,
            started_at: Utc::now(),
            plan: None,
            evidence: BTreeMap::new(),
            timeline: Timeline::default(),
            hypotheses: Vec::new(),
            verifications: Vec::new(),
            overall_confidence: 0.0,
            response: None,
            agent_history: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Apply an agent's patch. Evidence is routed by its payload kind.
    pub fn apply_patch(&mut self, patch: EvidencePatch) {
        for ev in patch.evidence {
            self.evidence.entry(ev.source()).or_default().push(ev);
        }
        self.errors.extend(patch.errors);
    }

    /// All evidence across sources, in canonical source order.
    pub fn all_evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.evidence.values().flatten()
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.values().map(Vec::len).sum()
    }

    pub fn evidence_for(&self, kind: SourceKind) -> &[Evidence] {
        self.evidence.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find_evidence(&self, id: Uuid) -> Option<&Evidence> {
        self.all_evidence().find(|ev| ev.id == id)
    }

    /// Check the run's structural invariants. Returns the list of
    /// violations; an empty list means the state is consistent.
    pub fn invariant_violations(&self, min_sources: usize) -> Vec<String> {
        let mut violations = Vec::new();

        // Every timeline event must reference existing evidence.
        for event in &self.timeline.events {
            if self.find_evidence(event.evidence_id).is_none() {
                violations.push(format!(
                    "timeline event {:?} references missing evidence {}",
                    event.event, event.evidence_id
                ));
            }
        }

        // Hypothesis and verification ids must be unique.
        let mut seen = std::collections::HashSet::new();
        for h in &self.hypotheses {
            if !seen.insert(h.id.as_str()) {
                violations.push(format!("duplicate hypothesis id {}", h.id));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for v in &self.verifications {
            if !seen.insert(v.hypothesis_id.as_str()) {
                violations.push(format!(
                    "duplicate verification for hypothesis {}",
                    v.hypothesis_id
                ));
            }
        }

        // SUPPORTED requires independent sources and no contradictions.
        for v in &self.verifications {
            if v.verdict == Verdict::Supported {
                if v.independent_sources < min_sources {
                    violations.push(format!(
                        "{} SUPPORTED with {} sources (minimum {})",
                        v.hypothesis_id, v.independent_sources, min_sources
                    ));
                }
                if !v.contradictions.is_empty() {
                    violations.push(format!(
                        "{} SUPPORTED despite contradictions",
                        v.hypothesis_id
                    ));
                }
            }
        }

        // Overall confidence aggregation rule.
        if !self.verifications.is_empty() {
            let supported_max = self
                .verifications
                .iter()
                .filter(|v| v.verdict == Verdict::Supported)
                .map(|v| v.confidence)
                .fold(f64::NAN, f64::max);
            let expected = if supported_max.is_nan() {
                self.verifications
                    .iter()
                    .map(|v| v.confidence)
                    .fold(0.0, f64::max)
            } else {
                supported_max
            };
            if (self.overall_confidence - expected).abs() > 1e-9 {
                violations.push(format!(
                    "overall confidence {} does not match aggregation rule (expected {})",
                    self.overall_confidence, expected
                ));
            }
        }

        violations
    }

    /// Fail the run on any invariant violation.
    pub fn validate(&self, min_sources: usize) -> Result<()> {
        let violations = self.invariant_violations(min_sources);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::invariant(violations.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidencePayload;
    use crate::timeline::TimelineEvent;
    use std::collections::BTreeMap as Map;

    fn request() -> AnalysisRequest {
        AnalysisRequest::from_raw(RawAnalysisRequest {
            query: "API returning 500s since 14:32 UTC".to_string(),
            timestamp: Some("2024-01-15T14:32:00Z".to_string()),
            services: vec!["API-Gateway".to_string()],
            ..Default::default()
        })
        .unwrap()
    }

    fn log_evidence(content: &str) -> Evidence {
        Evidence::new(
            content,
            None,
            0.9,
            EvidencePayload::Log {
                service: None,
                level: Some("ERROR".to_string()),
                matched_terms: vec![],
                similarity: None,
            },
        )
    }

    #[test]
    fn normalization_lowercases_services() {
        let req = request();
        assert_eq!(req.services, vec!["api-gateway"]);
    }

    #[test]
    fn rejects_empty_query() {
        let raw = RawAnalysisRequest {
            query: "   ".to_string(),
            timestamp: Some("2024-01-15T14:32:00Z".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            AnalysisRequest::from_raw(raw),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let raw = RawAnalysisRequest {
            query: "outage".to_string(),
            timestamp: Some("yesterday-ish".to_string()),
            ..Default::default()
        };
        assert!(AnalysisRequest::from_raw(raw).is_err());
    }

    #[test]
    fn input_hash_is_stable() {
        assert_eq!(request().compute_hash(), request().compute_hash());
    }

    #[test]
    fn patch_routes_evidence_by_kind() {
        let mut state = RunState::new(request());
        let patch = EvidencePatch {
            evidence: vec![log_evidence("HTTP 500 errors starting")],
            errors: vec!["metrics backend unreachable".to_string()],
        };
        state.apply_patch(patch);
        assert_eq!(state.evidence_for(SourceKind::Log).len(), 1);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.evidence_count(), 1);
    }

    #[test]
    fn dangling_timeline_reference_is_a_violation() {
        let mut state = RunState::new(request());
        state.timeline.events.push(TimelineEvent {
            time: Utc::now(),
            event: "CPU spike".to_string(),
            source: SourceKind::Metrics,
            confidence: 0.9,
            evidence_id: Uuid::new_v4(),
        });
        let violations = state.invariant_violations(2);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("missing evidence"));
    }

    #[test]
    fn supported_without_enough_sources_is_a_violation() {
        let mut state = RunState::new(request());
        state.verifications.push(VerificationResult {
            hypothesis_id: "H1".to_string(),
            verdict: Verdict::Supported,
            confidence: 0.8,
            evidence_summary: Map::new(),
            independent_sources: 1,
            contradictions: vec![],
            reasoning: String::new(),
        });
        state.overall_confidence = 0.8;
        assert!(state.validate(2).is_err());
    }

    #[test]
    fn overall_confidence_must_follow_max_rule() {
        let mut state = RunState::new(request());
        state.verifications.push(VerificationResult {
            hypothesis_id: "H1".to_string(),
            verdict: Verdict::InsufficientEvidence,
            confidence: 0.4,
            evidence_summary: Map::new(),
            independent_sources: 1,
            contradictions: vec![],
            reasoning: String::new(),
        });
        state.overall_confidence = 0.9;
        assert!(!state.invariant_violations(2).is_empty());
        state.overall_confidence = 0.4;
        assert!(state.invariant_violations(2).is_empty());
    }
}
