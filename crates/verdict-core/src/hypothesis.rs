//! Root cause hypotheses and their verification results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::SourceKind;

/// A candidate root cause. Immutable after the generator emits it; the
/// verifier produces a separate [`VerificationResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Unique within a run (H1..Hn).
    pub id: String,
    pub root_cause: String,
    /// Prior from the generator, in [0, 1].
    pub plausibility: f64,
    /// Ids of evidence the generator considered supporting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supporting_evidence: Vec<Uuid>,
    /// Evidence kinds that would strengthen this hypothesis.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_evidence: Vec<String>,
    /// Observations that would falsify this hypothesis.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub would_refute: Vec<String>,
}

/// Verification verdict for one hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Supported,
    InsufficientEvidence,
    Contradicted,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Supported => write!(f, "SUPPORTED"),
            Verdict::InsufficientEvidence => write!(f, "INSUFFICIENT_EVIDENCE"),
            Verdict::Contradicted => write!(f, "CONTRADICTED"),
        }
    }
}

/// Outcome of scoring one hypothesis against all collected evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub hypothesis_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    /// Supporting evidence excerpts grouped by source kind.
    pub evidence_summary: BTreeMap<SourceKind, Vec<String>>,
    /// Count of distinct source kinds with at least one supporting item.
    pub independent_sources: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contradictions: Vec<String>,
    pub reasoning: String,
}

impl VerificationResult {
    pub fn is_supported(&self) -> bool {
        self.verdict == Verdict::Supported
    }
}
