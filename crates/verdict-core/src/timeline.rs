//! Correlated timeline types.
//!
//! Timeline events are projections of evidence onto a single ordered
//! axis; every event carries a back-reference to the evidence it was
//! projected from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::SourceKind;

/// A single event on the correlated incident timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub time: DateTime<Utc>,
    /// Short label extracted from the evidence content.
    pub event: String,
    pub source: SourceKind,
    pub confidence: f64,
    /// The evidence this event was projected from.
    pub evidence_id: Uuid,
}

/// Strength of a cross-source correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStrength {
    Weak,
    Medium,
    Strong,
}

/// Co-occurrence of events from at least two distinct source kinds
/// within the correlation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    /// Human-readable pattern label, e.g. "deployment preceded errors".
    pub pattern: String,
    /// Evidence ids of the correlated events, in time order.
    pub evidence_ids: Vec<Uuid>,
    /// Distinct source kinds involved.
    pub sources: Vec<SourceKind>,
    /// Time span covered by the correlated events (seconds).
    pub span_secs: i64,
    pub strength: CorrelationStrength,
}

/// An interval inside the plan window with no evidence, or where one
/// expected source is silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineGap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// When set, a specific source was expected here and produced nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<SourceKind>,
}

impl TimelineGap {
    /// Human-readable description, used for missing-evidence lists.
    pub fn describe(&self) -> String {
        let minutes = (self.end - self.start).num_minutes();
        match self.missing {
            Some(kind) => format!("no {} evidence in the incident window", kind),
            None => format!(
                "{}-minute gap with no evidence between {} and {}",
                minutes,
                self.start.format("%H:%M:%S"),
                self.end.format("%H:%M:%S")
            ),
        }
    }
}

/// The full correlated timeline of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub events: Vec<TimelineEvent>,
    pub correlations: Vec<Correlation>,
    pub gaps: Vec<TimelineGap>,
}

impl Timeline {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
