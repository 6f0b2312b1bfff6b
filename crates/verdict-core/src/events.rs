//! Stage-completion events published by the orchestrator.
//!
//! External transports subscribe to these to emit server-sent progress;
//! the terminal event carries the full response.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::response::AnalysisResponse;

/// Pipeline stages, in execution order. The five evidence agents run
/// concurrently between `Planner` and `Timeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planner,
    Log,
    Rag,
    Metrics,
    Dashboard,
    Image,
    Timeline,
    Hypothesis,
    ToolEnrichment,
    Verifier,
    Decision,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Log => "log",
            Stage::Rag => "rag",
            Stage::Metrics => "metrics",
            Stage::Dashboard => "dashboard",
            Stage::Image => "image",
            Stage::Timeline => "timeline",
            Stage::Hypothesis => "hypothesis",
            Stage::ToolEnrichment => "tool_enrichment",
            Stage::Verifier => "verifier",
            Stage::Decision => "decision",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

/// One stage-completion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub analysis_id: Uuid,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events published on the run's progress channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A pipeline node finished.
    Stage(StageEvent),
    /// Terminal event: the run produced its response.
    Completed {
        analysis_id: Uuid,
        response: Box<AnalysisResponse>,
    },
}

impl ProgressEvent {
    pub fn analysis_id(&self) -> Uuid {
        match self {
            ProgressEvent::Stage(event) => event.analysis_id,
            ProgressEvent::Completed { analysis_id, .. } => *analysis_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_event_omits_empty_fields() {
        let event = StageEvent {
            analysis_id: Uuid::new_v4(),
            stage: Stage::Log,
            status: StageStatus::Completed,
            evidence_count: Some(4),
            confidence: None,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "log");
        assert_eq!(json["evidence_count"], 4);
        assert!(json.get("error").is_none());
    }
}
