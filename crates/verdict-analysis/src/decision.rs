//! Decision gate: the final answer / refuse / request-more-data call.
//!
//! Answers only when the overall confidence clears the threshold and at
//! least one hypothesis is SUPPORTED. A middling confidence with known
//! timeline gaps asks for the missing data instead; everything else is
//! a refusal that still carries the best partial explanation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use verdict_core::evidence::{Evidence, EvidencePayload, RagCorpus, SourceKind};
use verdict_core::hypothesis::{Hypothesis, VerificationResult, Verdict};
use verdict_core::response::{AlternativeHypothesis, Decision};
use verdict_core::timeline::Timeline;
use verdict_core::Config;

/// Listed as missing when the generator produced nothing at all.
const MISSING_HYPOTHESES: &str = "hypotheses";

const MAX_ACTIONS: usize = 5;
const MAX_ALTERNATIVES: usize = 2;
const MAX_MISSING: usize = 5;

/// What the gate decided, ready to be merged into the final response.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub confidence: f64,
    pub root_cause: Option<String>,
    pub recommended_actions: Option<Vec<String>>,
    pub alternative_hypotheses: Option<Vec<AlternativeHypothesis>>,
    pub missing_evidence: Option<Vec<String>>,
}

pub struct DecisionGate {
    config: Arc<Config>,
}

impl DecisionGate {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn decide(
        &self,
        hypotheses: &[Hypothesis],
        results: &[VerificationResult],
        timeline: &Timeline,
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        overall_confidence: f64,
    ) -> DecisionOutcome {
        let supported: Vec<&VerificationResult> =
            results.iter().filter(|r| r.is_supported()).collect();

        let outcome = if overall_confidence >= self.config.confidence_threshold
            && !supported.is_empty()
        {
            self.answer(hypotheses, results, &supported, evidence, overall_confidence)
        } else if overall_confidence >= 0.5 && !timeline.gaps.is_empty() {
            self.request_more_data(hypotheses, results, timeline, overall_confidence)
        } else {
            self.refuse(hypotheses, results, timeline, overall_confidence)
        };

        info!(
            decision = %outcome.decision,
            confidence = outcome.confidence,
            "decision gate resolved"
        );
        outcome
    }

    fn answer(
        &self,
        hypotheses: &[Hypothesis],
        results: &[VerificationResult],
        supported: &[&VerificationResult],
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        confidence: f64,
    ) -> DecisionOutcome {
        let winner = supported
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .expect("answer requires a supported hypothesis");
        let root_cause = hypotheses
            .iter()
            .find(|h| h.id == winner.hypothesis_id)
            .map(|h| h.root_cause.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let alternatives: Vec<AlternativeHypothesis> = results
            .iter()
            .filter(|r| r.hypothesis_id != winner.hypothesis_id && !r.is_supported())
            .filter_map(|r| {
                hypotheses
                    .iter()
                    .find(|h| h.id == r.hypothesis_id)
                    .map(|h| AlternativeHypothesis {
                        hypothesis: h.root_cause.clone(),
                        why_less_likely: r.reasoning.clone(),
                    })
            })
            .take(MAX_ALTERNATIVES)
            .collect();

        DecisionOutcome {
            decision: Decision::Answer,
            confidence,
            root_cause: Some(root_cause.clone()),
            recommended_actions: Some(recommended_actions(&root_cause, evidence)),
            alternative_hypotheses: (!alternatives.is_empty()).then_some(alternatives),
            missing_evidence: None,
        }
    }

    fn request_more_data(
        &self,
        hypotheses: &[Hypothesis],
        results: &[VerificationResult],
        timeline: &Timeline,
        confidence: f64,
    ) -> DecisionOutcome {
        let leading = hypotheses
            .iter()
            .max_by(|a, b| a.plausibility.total_cmp(&b.plausibility));

        // Gaps first: they are the concrete, fetchable holes.
        let mut missing: Vec<String> =
            timeline.gaps.iter().map(|g| g.describe()).collect();
        if let Some(leading) = leading {
            missing.extend(leading.required_evidence.iter().cloned());
        }
        dedup_preserving_order(&mut missing);
        missing.truncate(MAX_MISSING);

        let alternatives = leading.map(|h| {
            let reasoning = results
                .iter()
                .find(|r| r.hypothesis_id == h.id)
                .map(|r| r.reasoning.clone())
                .unwrap_or_default();
            vec![AlternativeHypothesis {
                hypothesis: h.root_cause.clone(),
                why_less_likely: reasoning,
            }]
        });

        DecisionOutcome {
            decision: Decision::RequestMoreData,
            confidence,
            root_cause: None,
            recommended_actions: None,
            alternative_hypotheses: alternatives,
            missing_evidence: Some(missing),
        }
    }

    fn refuse(
        &self,
        hypotheses: &[Hypothesis],
        results: &[VerificationResult],
        timeline: &Timeline,
        confidence: f64,
    ) -> DecisionOutcome {
        let mut missing: Vec<String> = timeline.gaps.iter().map(|g| g.describe()).collect();
        for result in results {
            if result.verdict == Verdict::InsufficientEvidence {
                if let Some(h) = hypotheses.iter().find(|h| h.id == result.hypothesis_id) {
                    missing.extend(h.required_evidence.iter().cloned());
                }
            }
        }
        // No hypotheses at all is the most fundamental lack; it leads
        // the ranking and never falls off the cap.
        if hypotheses.is_empty() {
            missing.insert(0, MISSING_HYPOTHESES.to_string());
        }
        dedup_preserving_order(&mut missing);
        missing.truncate(MAX_MISSING);

        // The best partial explanation still ships with the refusal.
        let mut ranked: Vec<&VerificationResult> = results.iter().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let alternatives: Vec<AlternativeHypothesis> = ranked
            .iter()
            .filter_map(|r| {
                hypotheses
                    .iter()
                    .find(|h| h.id == r.hypothesis_id)
                    .map(|h| AlternativeHypothesis {
                        hypothesis: h.root_cause.clone(),
                        why_less_likely: r.reasoning.clone(),
                    })
            })
            .take(MAX_ALTERNATIVES)
            .collect();

        DecisionOutcome {
            decision: Decision::Refuse,
            confidence,
            root_cause: None,
            recommended_actions: None,
            alternative_hypotheses: (!alternatives.is_empty()).then_some(alternatives),
            missing_evidence: Some(missing),
        }
    }
}

/// Keyword action library plus matched runbook pointers.
fn recommended_actions(
    root_cause: &str,
    evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
) -> Vec<String> {
    let lower = root_cause.to_lowercase();
    let mut actions = Vec::new();

    if lower.contains("deploy") || lower.contains("regression") {
        actions.push("Roll back the most recent deployment".to_string());
        actions.push("Review the deployment diff for the affected services".to_string());
    }
    if lower.contains("memory") || lower.contains("leak") {
        actions.push("Capture a heap dump for analysis".to_string());
        actions.push("Watch memory and GC metrics after mitigation".to_string());
    }
    if lower.contains("connection") || lower.contains("pool") {
        actions.push("Check connection pool configuration and limits".to_string());
        actions.push("Look for connection leaks in recent changes".to_string());
    }
    if lower.contains("cpu") {
        actions.push("Capture a profile to identify hot paths".to_string());
    }
    if lower.contains("traffic") || lower.contains("surge") || lower.contains("load") {
        actions.push("Review request rate and consider scaling out".to_string());
    }
    if lower.contains("config") {
        actions.push("Audit and revert recent configuration changes".to_string());
    }
    if lower.contains("dependency") || lower.contains("upstream") {
        actions.push("Check upstream dependency health and error budgets".to_string());
    }

    // Matched runbooks are the strongest recommendations.
    for ev in evidence.get(&SourceKind::Rag).map(Vec::as_slice).unwrap_or(&[]) {
        if let EvidencePayload::Rag {
            corpus: RagCorpus::Runbooks,
            ..
        } = &ev.payload
        {
            actions.push(format!("Consult {}", ev.content));
        }
    }

    if actions.is_empty() {
        actions.push("Review recent changes to the affected services".to_string());
        actions.push("Check service dependencies and health endpoints".to_string());
    }
    actions.truncate(MAX_ACTIONS);
    actions
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use verdict_core::timeline::TimelineGap;

    fn gate() -> DecisionGate {
        DecisionGate::new(Arc::new(Config::default()))
    }

    fn hypothesis(id: &str, root_cause: &str, plausibility: f64) -> Hypothesis {
        Hypothesis {
            id: id.to_string(),
            root_cause: root_cause.to_string(),
            plausibility,
            supporting_evidence: vec![],
            required_evidence: vec!["request rate metrics".to_string()],
            would_refute: vec![],
        }
    }

    fn result(id: &str, verdict: Verdict, confidence: f64) -> VerificationResult {
        VerificationResult {
            hypothesis_id: id.to_string(),
            verdict,
            confidence,
            evidence_summary: BTreeMap::new(),
            independent_sources: if verdict == Verdict::Supported { 3 } else { 1 },
            contradictions: vec![],
            reasoning: format!("{} at {:.2}", verdict, confidence),
        }
    }

    fn gap_timeline() -> Timeline {
        let mut timeline = Timeline::default();
        timeline.gaps.push(TimelineGap {
            start: Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 15, 14, 10, 0).unwrap(),
            missing: Some(SourceKind::Metrics),
        });
        timeline
    }

    #[test]
    fn high_confidence_supported_answers() {
        let hypotheses = vec![
            hypothesis("H1", "Regression introduced by the recent deployment", 0.85),
            hypothesis("H2", "Traffic surge exhausting connection capacity", 0.6),
        ];
        let results = vec![
            result("H1", Verdict::Supported, 0.86),
            result("H2", Verdict::InsufficientEvidence, 0.4),
        ];

        let outcome = gate().decide(
            &hypotheses,
            &results,
            &Timeline::default(),
            &BTreeMap::new(),
            0.86,
        );

        assert_eq!(outcome.decision, Decision::Answer);
        assert_eq!(
            outcome.root_cause.as_deref(),
            Some("Regression introduced by the recent deployment")
        );
        let actions = outcome.recommended_actions.unwrap();
        assert!(actions.iter().any(|a| a.contains("Roll back")));
        let alternatives = outcome.alternative_hypotheses.unwrap();
        assert_eq!(alternatives.len(), 1);
        assert!(alternatives[0].hypothesis.contains("Traffic surge"));
    }

    #[test]
    fn mid_confidence_with_gaps_requests_more_data() {
        let hypotheses = vec![hypothesis("H1", "Traffic surge", 0.6)];
        let results = vec![result("H1", Verdict::InsufficientEvidence, 0.58)];

        let outcome = gate().decide(
            &hypotheses,
            &results,
            &gap_timeline(),
            &BTreeMap::new(),
            0.58,
        );

        assert_eq!(outcome.decision, Decision::RequestMoreData);
        let missing = outcome.missing_evidence.unwrap();
        assert!(missing.iter().any(|m| m.contains("metrics")));
        assert!(missing.iter().any(|m| m.contains("request rate")));
    }

    #[test]
    fn mid_confidence_without_gaps_refuses() {
        let hypotheses = vec![hypothesis("H1", "Traffic surge", 0.6)];
        let results = vec![result("H1", Verdict::InsufficientEvidence, 0.58)];

        let outcome = gate().decide(
            &hypotheses,
            &results,
            &Timeline::default(),
            &BTreeMap::new(),
            0.58,
        );
        assert_eq!(outcome.decision, Decision::Refuse);
    }

    #[test]
    fn no_hypotheses_refuses_with_marker() {
        let outcome = gate().decide(&[], &[], &Timeline::default(), &BTreeMap::new(), 0.0);

        assert_eq!(outcome.decision, Decision::Refuse);
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome
            .missing_evidence
            .unwrap()
            .contains(&"hypotheses".to_string()));
    }

    #[test]
    fn zero_threshold_answers_any_supported() {
        let mut config = Config::default();
        config.confidence_threshold = 0.0;
        let gate = DecisionGate::new(Arc::new(config));

        let hypotheses = vec![hypothesis("H1", "Something plausible", 0.5)];
        let results = vec![result("H1", Verdict::Supported, 0.51)];
        let outcome = gate.decide(
            &hypotheses,
            &results,
            &Timeline::default(),
            &BTreeMap::new(),
            0.51,
        );
        assert_eq!(outcome.decision, Decision::Answer);
    }

    #[test]
    fn runbook_evidence_becomes_an_action() {
        let mut evidence: BTreeMap<SourceKind, Vec<Evidence>> = BTreeMap::new();
        evidence.insert(
            SourceKind::Rag,
            vec![Evidence::new(
                "Runbook 'Memory exhaustion triage'",
                None,
                0.7,
                EvidencePayload::Rag {
                    corpus: RagCorpus::Runbooks,
                    document_id: "rb-memory".to_string(),
                    similarity: 0.7,
                },
            )],
        );

        let actions = recommended_actions("Memory leak in api-gateway", &evidence);
        assert!(actions.iter().any(|a| a.contains("heap dump")));
        assert!(actions
            .iter()
            .any(|a| a.contains("Runbook 'Memory exhaustion triage'")));
    }
}
