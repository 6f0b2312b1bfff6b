//! Verifier: scores every hypothesis against all collected evidence.
//!
//! The quality gate of the pipeline. A hypothesis is SUPPORTED only
//! with enough independent source kinds behind it and nothing
//! contradicting it; everything else is INSUFFICIENT_EVIDENCE or
//! CONTRADICTED. The confidence formula combines source breadth,
//! supporting quality, contradiction penalty, and timeline consistency.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use verdict_core::evidence::{Evidence, EvidencePayload, SourceKind};
use verdict_core::hypothesis::{Hypothesis, VerificationResult, Verdict};
use verdict_core::plan::Plan;
use verdict_core::timeline::Timeline;
use verdict_core::Config;

/// Key terms needed in an evidence item before it counts as support.
const MIN_TERM_MATCHES: usize = 2;
/// Excerpts kept per source in the summary.
const MAX_EXCERPT_LEN: usize = 150;

/// Markers that read as "everything was normal".
const NORMALITY_MARKERS: &[&str] = &[
    "stable",
    "normal",
    "healthy",
    "no anomalies",
    "no deployment",
    "no recent deploy",
    "no errors",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "at", "to", "from", "by", "into", "with", "until", "this",
    "that", "over", "and", "for",
];

pub struct Verifier {
    config: Arc<Config>,
}

impl Verifier {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Verify every hypothesis; returns the results in hypothesis order
    /// plus the overall confidence (max over SUPPORTED, else max over
    /// all).
    pub fn verify_all(
        &self,
        hypotheses: &[Hypothesis],
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        timeline: &Timeline,
        plan: &Plan,
    ) -> (Vec<VerificationResult>, f64) {
        let results: Vec<VerificationResult> = hypotheses
            .iter()
            .map(|h| self.verify_one(h, evidence, timeline, plan))
            .collect();
        let overall = overall_confidence(&results);
        debug!(
            hypotheses = results.len(),
            overall_confidence = overall,
            "verification complete"
        );
        (results, overall)
    }

    fn verify_one(
        &self,
        hypothesis: &Hypothesis,
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        timeline: &Timeline,
        plan: &Plan,
    ) -> VerificationResult {
        let terms = key_terms(&hypothesis.root_cause);

        // Step 1: supporting evidence per source kind: semantic term
        // match, plus anything the generator explicitly linked.
        let mut summary: BTreeMap<SourceKind, Vec<String>> = BTreeMap::new();
        let mut supporting: Vec<&Evidence> = Vec::new();
        for items in evidence.values() {
            for ev in items {
                let linked = hypothesis.supporting_evidence.contains(&ev.id);
                if linked || term_matches(&ev.content, &terms) >= MIN_TERM_MATCHES {
                    summary
                        .entry(ev.source())
                        .or_default()
                        .push(excerpt(&ev.content, ev.confidence));
                    supporting.push(ev);
                }
            }
        }

        // Step 2: independent sources = distinct kinds with support.
        let independent_sources = summary.len();

        // Step 3: contradictions.
        let contradictions = detect_contradictions(hypothesis, evidence, &terms);
        let has_contradiction = !contradictions.is_empty();

        // Step 4: timeline consistency.
        let consistency = timeline_consistency(&supporting, timeline, plan);

        // Step 5: confidence.
        let avg_support = if supporting.is_empty() {
            0.0
        } else {
            supporting.iter().map(|ev| ev.confidence).sum::<f64>() / supporting.len() as f64
        };
        let base = (independent_sources as f64 / 3.0).min(1.0) * avg_support;
        let confidence = (base
            * if has_contradiction { 0.6 } else { 1.0 }
            * consistency)
            .clamp(0.0, 1.0);

        // Step 6: verdict.
        let verdict = if independent_sources >= self.config.min_evidence_sources
            && !has_contradiction
            && confidence >= 0.5
        {
            Verdict::Supported
        } else if has_contradiction && confidence < 0.4 {
            Verdict::Contradicted
        } else {
            Verdict::InsufficientEvidence
        };

        let reasoning = reasoning_for(
            verdict,
            confidence,
            independent_sources,
            &contradictions,
            consistency,
        );

        VerificationResult {
            hypothesis_id: hypothesis.id.clone(),
            verdict,
            confidence,
            evidence_summary: summary,
            independent_sources,
            contradictions,
            reasoning,
        }
    }

    /// Goal text for the enrichment loop, naming the weakest hypotheses
    /// and the evidence kinds they are missing. Re-scoring only; the
    /// loop never adds hypotheses.
    pub fn enrichment_goal(
        &self,
        hypotheses: &[Hypothesis],
        results: &[VerificationResult],
    ) -> String {
        let mut weakest: Vec<(&VerificationResult, &Hypothesis)> = results
            .iter()
            .filter(|r| r.verdict != Verdict::Supported)
            .filter_map(|r| {
                hypotheses
                    .iter()
                    .find(|h| h.id == r.hypothesis_id)
                    .map(|h| (r, h))
            })
            .collect();
        weakest.sort_by(|a, b| a.0.confidence.total_cmp(&b.0.confidence));

        let mut goal = String::from(
            "Confidence is below the decision threshold. Gather evidence that confirms or refutes these hypotheses:\n",
        );
        for (result, hypothesis) in weakest.iter().take(3) {
            goal.push_str(&format!(
                "- {} ({}, confidence {:.2});",
                hypothesis.root_cause, result.verdict, result.confidence
            ));
            if !hypothesis.required_evidence.is_empty() {
                goal.push_str(&format!(
                    " missing: {}",
                    hypothesis.required_evidence.join(", ")
                ));
            }
            goal.push('\n');
        }
        goal
    }
}

/// Overall confidence: max over SUPPORTED results, else max over all.
pub fn overall_confidence(results: &[VerificationResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let supported = results
        .iter()
        .filter(|r| r.verdict == Verdict::Supported)
        .map(|r| r.confidence)
        .fold(f64::NAN, f64::max);
    if supported.is_nan() {
        results.iter().map(|r| r.confidence).fold(0.0, f64::max)
    } else {
        supported
    }
}

fn key_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3 && !STOPWORDS.contains(t))
        .map(String::from)
        .collect()
}

/// A term matches on its stem so "deployment" still hits "deploy".
fn term_matches(content: &str, terms: &[String]) -> usize {
    let content = content.to_lowercase();
    terms
        .iter()
        .filter(|term| {
            let stem: String = term.chars().take(6).collect();
            content.contains(&stem)
        })
        .count()
}

fn excerpt(content: &str, confidence: f64) -> String {
    let mut text = content.to_string();
    if text.len() > MAX_EXCERPT_LEN {
        let mut cut = MAX_EXCERPT_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    format!("{} (confidence: {:.2})", text, confidence)
}

fn detect_contradictions(
    hypothesis: &Hypothesis,
    evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
    terms: &[String],
) -> Vec<String> {
    let mut contradictions = Vec::new();
    let mentions_deploy = hypothesis.root_cause.to_lowercase().contains("deploy");

    for items in evidence.values() {
        for ev in items {
            let content = ev.content.to_lowercase();

            // Direct hit on a stated refutation condition.
            for refutation in &hypothesis.would_refute {
                let refutation_lower = refutation.to_lowercase();
                if content.contains(&refutation_lower) {
                    contradictions.push(format!("[{}] {}", ev.source(), ev.content));
                }
            }

            // Normality markers touching the hypothesis subject:
            // "metric normal", "service healthy during window".
            let normal = NORMALITY_MARKERS.iter().any(|m| content.contains(m));
            if normal && term_matches(&ev.content, terms) >= 1 {
                // A metrics series with anomalies is not a normality
                // statement even if its text mentions a stable mean.
                let anomalous = matches!(
                    &ev.payload,
                    EvidencePayload::Metrics { anomalies, .. } if !anomalies.is_empty()
                );
                if !anomalous {
                    contradictions.push(format!("[{}] {}", ev.source(), ev.content));
                }
            }

            // Deployment hypotheses die on "no deployment in window".
            if mentions_deploy
                && (content.contains("no deployment") || content.contains("no recent deploy"))
            {
                contradictions.push(format!("[{}] {}", ev.source(), ev.content));
            }
        }
    }

    contradictions.sort();
    contradictions.dedup();
    contradictions
}

/// Fraction of timestamped supporting events inside the plan window,
/// mapped into [0.6, 1.0]. No timeline at all reads as inconsistent.
fn timeline_consistency(supporting: &[&Evidence], timeline: &Timeline, plan: &Plan) -> f64 {
    if timeline.is_empty() {
        return 0.6;
    }
    let window = plan.observation_window();
    let start = window.start(plan.incident_time);
    let end = window.end(plan.incident_time);

    let timestamped: Vec<_> = supporting.iter().filter_map(|ev| ev.timestamp).collect();
    if timestamped.is_empty() {
        // Nothing to judge; neither penalize nor reward fully.
        return 0.8;
    }
    let inside = timestamped
        .iter()
        .filter(|t| **t >= start && **t <= end)
        .count();
    0.6 + 0.4 * (inside as f64 / timestamped.len() as f64)
}

fn reasoning_for(
    verdict: Verdict,
    confidence: f64,
    independent_sources: usize,
    contradictions: &[String],
    consistency: f64,
) -> String {
    match verdict {
        Verdict::Supported => {
            let mut reasoning = format!(
                "Hypothesis supported by {} independent sources (confidence: {:.2}). ",
                independent_sources, confidence
            );
            if consistency >= 0.99 {
                reasoning.push_str("Timeline is consistent.");
            } else {
                reasoning.push_str("Minor timeline gaps but overall plausible.");
            }
            reasoning
        }
        Verdict::Contradicted => format!(
            "Hypothesis contradicted by evidence ({} contradiction(s)): {}",
            contradictions.len(),
            contradictions
                .iter()
                .take(2)
                .cloned()
                .collect::<Vec<_>>()
                .join("; ")
        ),
        Verdict::InsufficientEvidence => {
            let mut reasoning = format!(
                "Insufficient evidence: {} independent source(s), confidence {:.2}. ",
                independent_sources, confidence
            );
            if contradictions.is_empty() {
                reasoning.push_str("At least 2 independent sources are required.");
            } else {
                reasoning.push_str("Contradicting evidence present.");
            }
            reasoning
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use verdict_core::evidence::{
        AnomalyKind, DashboardItemKind, MetricAnomaly, MetricStats, RagCorpus,
    };
    use verdict_core::plan::{AgentName, Priority, SearchWindow};
    use verdict_core::timeline::TimelineEvent;

    fn incident() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 0).unwrap()
    }

    fn plan() -> Plan {
        let mut windows = BTreeMap::new();
        windows.insert(AgentName::Log, SearchWindow::symmetric(30));
        Plan {
            incident_time: incident(),
            affected_services: vec!["api-gateway".to_string()],
            symptoms: vec![],
            search_windows: windows,
            required_agents: vec![AgentName::Log],
            priority: Priority::High,
        }
    }

    fn verifier() -> Verifier {
        Verifier::new(Arc::new(Config::default()))
    }

    fn log_ev(content: &str, offset_secs: i64, confidence: f64) -> Evidence {
        Evidence::new(
            content,
            Some(incident() + Duration::seconds(offset_secs)),
            confidence,
            EvidencePayload::Log {
                service: Some("api-gateway".to_string()),
                level: Some("ERROR".to_string()),
                matched_terms: vec![],
                similarity: None,
            },
        )
    }

    fn rag_ev(content: &str, confidence: f64) -> Evidence {
        Evidence::new(
            content,
            None,
            confidence,
            EvidencePayload::Rag {
                corpus: RagCorpus::Incidents,
                document_id: "INC-2023-089".to_string(),
                similarity: confidence,
            },
        )
    }

    fn annotation_ev(content: &str, offset_secs: i64) -> Evidence {
        Evidence::new(
            content,
            Some(incident() + Duration::seconds(offset_secs)),
            0.85,
            EvidencePayload::Dashboard {
                uid: None,
                title: content.to_string(),
                kind: DashboardItemKind::Annotation,
                tags: vec!["deployment".to_string()],
            },
        )
    }

    fn metric_ev(content: &str, anomalous: bool, offset_secs: i64) -> Evidence {
        let anomalies = if anomalous {
            vec![MetricAnomaly {
                time: incident() + Duration::seconds(offset_secs),
                value: 42.0,
                kind: AnomalyKind::ZScore { score: 4.0 },
            }]
        } else {
            vec![]
        };
        Evidence::new(
            content,
            Some(incident() + Duration::seconds(offset_secs)),
            if anomalous { 0.9 } else { 0.35 },
            EvidencePayload::Metrics {
                metric: "m".to_string(),
                job: "api-gateway".to_string(),
                query: "q".to_string(),
                stats: MetricStats {
                    min: 0.0,
                    max: 42.0,
                    mean: 3.0,
                    stddev: 8.0,
                },
                anomalies,
            },
        )
    }

    fn by_source(items: Vec<Evidence>) -> BTreeMap<SourceKind, Vec<Evidence>> {
        let mut map: BTreeMap<SourceKind, Vec<Evidence>> = BTreeMap::new();
        for ev in items {
            map.entry(ev.source()).or_default().push(ev);
        }
        map
    }

    fn timeline_for(evidence: &BTreeMap<SourceKind, Vec<Evidence>>) -> Timeline {
        let mut timeline = Timeline::default();
        for ev in evidence.values().flatten() {
            if let Some(time) = ev.timestamp {
                timeline.events.push(TimelineEvent {
                    time,
                    event: ev.content.clone(),
                    source: ev.source(),
                    confidence: ev.confidence,
                    evidence_id: ev.id,
                });
            }
        }
        timeline.events.sort_by_key(|e| e.time);
        timeline
    }

    fn deployment_hypothesis(supporting: Vec<uuid::Uuid>) -> Hypothesis {
        Hypothesis {
            id: "H1".to_string(),
            root_cause: "Regression introduced by the recent deployment".to_string(),
            plausibility: 0.85,
            supporting_evidence: supporting,
            required_evidence: vec!["deployment change log".to_string()],
            would_refute: vec!["no deployment in window".to_string()],
        }
    }

    #[test]
    fn four_source_deployment_case_is_supported() {
        let items = vec![
            log_ev("ERROR HTTP 500 errors after deploy", 5, 0.9),
            rag_ev(
                "INC-2023-089: similar outage caused by a bad deploy",
                0.82,
            ),
            annotation_ev("deployment v2.1.5", -120),
            metric_ev("http_requests_5xx spiked after deployment", true, 10),
        ];
        // The generator links the evidence it considered supporting.
        let linked: Vec<uuid::Uuid> = items.iter().map(|ev| ev.id).collect();
        let evidence = by_source(items);
        let timeline = timeline_for(&evidence);
        let hypothesis = deployment_hypothesis(linked);

        let (results, overall) =
            verifier().verify_all(&[hypothesis], &evidence, &timeline, &plan());

        assert_eq!(results[0].verdict, Verdict::Supported);
        assert!(results[0].independent_sources >= 3);
        assert!(results[0].contradictions.is_empty());
        assert!(overall >= 0.8, "expected >= 0.8, got {}", overall);
    }

    #[test]
    fn single_source_is_never_supported() {
        let item = log_ev("deployment regression caused errors", 5, 0.95);
        let linked = vec![item.id];
        let evidence = by_source(vec![item]);
        let timeline = timeline_for(&evidence);
        let hypothesis = deployment_hypothesis(linked);

        let (results, _) = verifier().verify_all(&[hypothesis], &evidence, &timeline, &plan());
        assert_eq!(results[0].verdict, Verdict::InsufficientEvidence);
        assert_eq!(results[0].independent_sources, 1);
    }

    #[test]
    fn normal_metric_contradicts_pool_exhaustion() {
        let logs = log_ev("connection pool exhausted, timeouts acquiring connection", 5, 0.9);
        let normal_metric = metric_ev(
            "pg_stat_activity_count stable at 12 of 100 connections (no anomalies detected)",
            false,
            0,
        );
        let evidence = by_source(vec![logs, normal_metric]);
        let timeline = timeline_for(&evidence);

        let hypothesis = Hypothesis {
            id: "H1".to_string(),
            root_cause: "Database connection pool exhaustion".to_string(),
            plausibility: 0.8,
            supporting_evidence: vec![],
            required_evidence: vec!["connection pool metrics".to_string()],
            would_refute: vec!["connection count normal".to_string()],
        };

        let (results, _) = verifier().verify_all(&[hypothesis], &evidence, &timeline, &plan());
        assert_eq!(results[0].verdict, Verdict::Contradicted);
        assert!(!results[0].contradictions.is_empty());
    }

    #[test]
    fn anomalous_metric_is_not_read_as_normality() {
        let evidence = by_source(vec![
        log_ev("memory leak suspected in api-gateway", 5, 0.9),
            metric_ev(
                "memory_usage_mb spiked to 42.0, window mean stable before",
                true,
                10,
            ),
        ]);
        let timeline = timeline_for(&evidence);
        let hypothesis = Hypothesis {
            id: "H1".to_string(),
            root_cause: "Memory leak exhausting the api-gateway heap".to_string(),
            plausibility: 0.8,
            supporting_evidence: vec![],
            required_evidence: vec![],
            would_refute: vec![],
        };

        let (results, _) = verifier().verify_all(&[hypothesis], &evidence, &timeline, &plan());
        assert!(results[0].contradictions.is_empty());
    }

    #[test]
    fn overall_confidence_prefers_supported() {
        let supported = VerificationResult {
            hypothesis_id: "H1".to_string(),
            verdict: Verdict::Supported,
            confidence: 0.75,
            evidence_summary: BTreeMap::new(),
            independent_sources: 3,
            contradictions: vec![],
            reasoning: String::new(),
        };
        let insufficient = VerificationResult {
            hypothesis_id: "H2".to_string(),
            verdict: Verdict::InsufficientEvidence,
            confidence: 0.9,
            evidence_summary: BTreeMap::new(),
            independent_sources: 1,
            contradictions: vec![],
            reasoning: String::new(),
        };

        // Max over SUPPORTED wins even when an unsupported result has a
        // numerically higher score.
        assert_eq!(
            overall_confidence(&[supported.clone(), insufficient.clone()]),
            0.75
        );
        assert_eq!(overall_confidence(&[insufficient]), 0.9);
        assert_eq!(overall_confidence(&[]), 0.0);
    }

    #[test]
    fn events_outside_window_degrade_confidence() {
        let near_items = vec![
            log_ev("deployment errors rising", 5, 0.9),
            annotation_ev("deployment v2.1.5", -60),
        ];
        let far_items = vec![
            log_ev("deployment errors rising", 5, 0.9),
            annotation_ev("deployment v2.1.5", -3 * 3600),
        ];
        let near_hypothesis =
            deployment_hypothesis(near_items.iter().map(|ev| ev.id).collect());
        let far_hypothesis = deployment_hypothesis(far_items.iter().map(|ev| ev.id).collect());
        let near = by_source(near_items);
        let far = by_source(far_items);

        let (near_results, _) =
            verifier().verify_all(&[near_hypothesis], &near, &timeline_for(&near), &plan());
        let (far_results, _) =
            verifier().verify_all(&[far_hypothesis], &far, &timeline_for(&far), &plan());

        assert!(near_results[0].confidence > far_results[0].confidence);
    }

    #[test]
    fn enrichment_goal_names_weak_hypotheses() {
        let hypothesis = deployment_hypothesis(vec![]);
        let result = VerificationResult {
            hypothesis_id: "H1".to_string(),
            verdict: Verdict::InsufficientEvidence,
            confidence: 0.42,
            evidence_summary: BTreeMap::new(),
            independent_sources: 1,
            contradictions: vec![],
            reasoning: String::new(),
        };
        let goal = verifier().enrichment_goal(&[hypothesis], &[result]);
        assert!(goal.contains("Regression introduced"));
        assert!(goal.contains("deployment change log"));
    }
}
