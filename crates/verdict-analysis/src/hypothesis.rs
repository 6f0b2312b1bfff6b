//! Hypothesis generator: 2–5 candidate root causes.
//!
//! Preferred path is a schema-constrained model call over the timeline,
//! correlations, and top evidence. The fallback is a rule library keyed
//! on evidence patterns (deployment→errors, memory→crash, traffic
//! surge→latency, config→connection failure, dependency
//! timeout→cascade). Either path yields the same shape; hypotheses are
//! deduplicated and ranked by plausibility.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use verdict_backends::{ChatMessage, ChatRequest, LlmClient};
use verdict_core::evidence::{Evidence, SourceKind};
use verdict_core::hypothesis::Hypothesis;
use verdict_core::timeline::Timeline;
use verdict_core::{Config, Error, Result};

use crate::agents::planner::strip_code_fences;
use crate::prompts::HYPOTHESIS_PROMPT;

/// Evidence items shown to the model.
const MAX_PROMPT_EVIDENCE: usize = 20;
/// Token-overlap ratio above which two root causes are duplicates.
const DEDUP_OVERLAP: f64 = 0.6;

#[derive(Debug, Deserialize)]
struct HypothesisDraft {
    root_cause: String,
    #[serde(default = "default_plausibility")]
    plausibility: f64,
    #[serde(default)]
    supporting_evidence: Vec<String>,
    #[serde(default)]
    required_evidence: Vec<String>,
    #[serde(default)]
    would_refute: Vec<String>,
}

fn default_plausibility() -> f64 {
    0.5
}

pub struct HypothesisGenerator {
    config: Arc<Config>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl HypothesisGenerator {
    pub fn new(config: Arc<Config>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    /// Generate ranked hypotheses. Never fails the run; model problems
    /// fall back to the rule library and surface as notes.
    pub async fn generate(
        &self,
        timeline: &Timeline,
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        cancel: &CancellationToken,
    ) -> (Vec<Hypothesis>, Vec<String>) {
        let mut notes = Vec::new();

        let mut hypotheses = match &self.llm {
            Some(llm) if !cancel.is_cancelled() => {
                match self.llm_generate(llm.as_ref(), timeline, evidence, cancel).await {
                    Ok(hypotheses) => hypotheses,
                    Err(e) => {
                        warn!(error = %e, "hypothesis model path failed, using rule library");
                        notes.push(format!("hypothesis generation fell back to rules: {}", e));
                        rule_generate(timeline, evidence)
                    }
                }
            }
            _ => rule_generate(timeline, evidence),
        };

        hypotheses = dedup(hypotheses);
        hypotheses.sort_by(|a, b| b.plausibility.total_cmp(&a.plausibility));
        hypotheses.truncate(self.config.max_hypotheses);

        // Ids are assigned after ranking so H1 is always the leader.
        for (index, hypothesis) in hypotheses.iter_mut().enumerate() {
            hypothesis.id = format!("H{}", index + 1);
        }

        debug!(count = hypotheses.len(), "hypotheses generated");
        (hypotheses, notes)
    }

    /// Whether the generator should ask the enrichment loop for more
    /// evidence: fewer than two hypotheses reached plausibility 0.5.
    pub fn needs_enrichment(&self, hypotheses: &[Hypothesis]) -> bool {
        hypotheses.iter().filter(|h| h.plausibility >= 0.5).count() < 2
    }

    async fn llm_generate(
        &self,
        llm: &dyn LlmClient,
        timeline: &Timeline,
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Hypothesis>> {
        let numbered: Vec<&Evidence> = evidence
            .values()
            .flatten()
            .take(MAX_PROMPT_EVIDENCE)
            .collect();

        let mut context = String::from("Timeline:\n");
        for event in timeline.events.iter().take(10) {
            context.push_str(&format!(
                "  {} [{}] {}\n",
                event.time.format("%H:%M:%S"),
                event.source,
                event.event
            ));
        }
        if !timeline.correlations.is_empty() {
            context.push_str("\nCorrelations:\n");
            for corr in timeline.correlations.iter().take(5) {
                context.push_str(&format!("  {} ({:?})\n", corr.pattern, corr.strength));
            }
        }
        context.push_str("\nEvidence:\n");
        for (index, ev) in numbered.iter().enumerate() {
            context.push_str(&format!(
                "  E{} [{}] {}\n",
                index + 1,
                ev.source(),
                ev.content
            ));
        }

        let prompt = format!("{}\n\n{}", HYPOTHESIS_PROMPT, context);
        let chat = ChatRequest::new(&self.config.llm_primary_model)
            .with_message(ChatMessage::user_text(prompt))
            .with_max_tokens(2048);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = llm.complete(chat) => response.map_err(|e| Error::model(e.to_string()))?,
        };

        let text = response.text();
        let json = strip_code_fences(&text);

        // Accept a bare array or an object wrapping one.
        let drafts: Vec<HypothesisDraft> = match serde_json::from_str(json) {
            Ok(drafts) => drafts,
            Err(_) => {
                #[derive(Deserialize)]
                struct Wrapper {
                    hypotheses: Vec<HypothesisDraft>,
                }
                serde_json::from_str::<Wrapper>(json)
                    .map(|w| w.hypotheses)
                    .map_err(|e| Error::model(format!("unparseable hypotheses: {}", e)))?
            }
        };

        if drafts.is_empty() {
            return Err(Error::model("model produced no hypotheses"));
        }

        Ok(drafts
            .into_iter()
            .map(|draft| Hypothesis {
                id: String::new(),
                root_cause: draft.root_cause,
                plausibility: draft.plausibility.clamp(0.0, 1.0),
                supporting_evidence: resolve_evidence_refs(&draft.supporting_evidence, &numbered),
                required_evidence: draft.required_evidence,
                would_refute: draft.would_refute,
            })
            .collect())
    }
}

/// Map "E3"-style references back to evidence ids.
fn resolve_evidence_refs(refs: &[String], numbered: &[&Evidence]) -> Vec<Uuid> {
    refs.iter()
        .filter_map(|r| {
            r.trim()
                .trim_start_matches(['E', 'e'])
                .parse::<usize>()
                .ok()
        })
        .filter_map(|index| numbered.get(index.checked_sub(1)?).map(|ev| ev.id))
        .collect()
}

// =============================================================================
// RULE LIBRARY
// =============================================================================

struct PatternFlags {
    deployment: bool,
    errors: bool,
    memory: bool,
    cpu: bool,
    connection: bool,
    traffic: bool,
    timeout: bool,
    config_change: bool,
}

fn scan_flags(timeline: &Timeline, evidence: &BTreeMap<SourceKind, Vec<Evidence>>) -> PatternFlags {
    let mut corpus: Vec<String> = evidence
        .values()
        .flatten()
        .map(|ev| ev.content.to_lowercase())
        .collect();
    corpus.extend(timeline.events.iter().map(|e| e.event.to_lowercase()));

    let has = |keywords: &[&str]| {
        corpus
            .iter()
            .any(|text| keywords.iter().any(|kw| text.contains(kw)))
    };

    PatternFlags {
        deployment: has(&["deploy", "release", "rollout"]),
        errors: has(&["error", "5xx", "500", "exception", "failure"]),
        memory: has(&["memory", "oom", "heap", "leak"]),
        cpu: has(&["cpu", "load average", "throttl"]),
        connection: has(&["connection", "pool", "socket"]),
        traffic: has(&["traffic", "surge", "request rate", "spike in requests"]),
        timeout: has(&["timeout", "timed out", "deadline exceeded"]),
        config_change: has(&["config", "setting", "feature flag"]),
    }
}

/// Collect evidence ids whose content matches any of the keywords.
fn matching_ids(evidence: &BTreeMap<SourceKind, Vec<Evidence>>, keywords: &[&str]) -> Vec<Uuid> {
    evidence
        .values()
        .flatten()
        .filter(|ev| {
            let content = ev.content.to_lowercase();
            keywords.iter().any(|kw| content.contains(kw))
        })
        .map(|ev| ev.id)
        .collect()
}

/// Rule-based generation. Emits only hypotheses whose trigger pattern is
/// actually present; with no matching patterns the result is empty.
fn rule_generate(
    timeline: &Timeline,
    evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
) -> Vec<Hypothesis> {
    let flags = scan_flags(timeline, evidence);
    let mut hypotheses = Vec::new();

    if flags.deployment && (flags.errors || flags.memory || flags.cpu) {
        hypotheses.push(Hypothesis {
            id: String::new(),
            root_cause: "Regression introduced by the recent deployment".to_string(),
            plausibility: 0.85,
            supporting_evidence: matching_ids(evidence, &["deploy", "error", "5xx", "500"]),
            required_evidence: vec![
                "deployment change log".to_string(),
                "metrics before and after the deploy".to_string(),
            ],
            would_refute: vec![
                "issue started before deployment".to_string(),
                "no deployment in window".to_string(),
            ],
        });
    }

    if flags.memory {
        hypotheses.push(Hypothesis {
            id: String::new(),
            root_cause: "Memory exhaustion degrading the service until crash".to_string(),
            plausibility: 0.8,
            supporting_evidence: matching_ids(evidence, &["memory", "oom", "heap", "leak"]),
            required_evidence: vec![
                "heap dump".to_string(),
                "memory usage metrics over time".to_string(),
            ],
            would_refute: vec![
                "memory stable".to_string(),
                "memory usage remains normal".to_string(),
            ],
        });
    }

    if flags.traffic || (flags.connection && flags.errors) {
        hypotheses.push(Hypothesis {
            id: String::new(),
            root_cause: "Traffic surge exhausting connection capacity".to_string(),
            plausibility: if flags.traffic { 0.6 } else { 0.5 },
            supporting_evidence: matching_ids(
                evidence,
                &["traffic", "surge", "connection", "pool"],
            ),
            required_evidence: vec![
                "request rate metrics".to_string(),
                "connection pool metrics".to_string(),
            ],
            would_refute: vec![
                "request rate at normal levels".to_string(),
                "connection count normal".to_string(),
            ],
        });
    }

    if flags.config_change && (flags.connection || flags.errors) {
        hypotheses.push(Hypothesis {
            id: String::new(),
            root_cause: "Configuration change breaking downstream connections".to_string(),
            plausibility: 0.55,
            supporting_evidence: matching_ids(evidence, &["config", "setting", "connection"]),
            required_evidence: vec!["configuration change history".to_string()],
            would_refute: vec!["no config changes in timeframe".to_string()],
        });
    }

    if flags.timeout {
        hypotheses.push(Hypothesis {
            id: String::new(),
            root_cause: "Upstream dependency degradation cascading into failures".to_string(),
            plausibility: 0.5,
            supporting_evidence: matching_ids(evidence, &["timeout", "upstream", "dependency"]),
            required_evidence: vec![
                "dependency health status".to_string(),
                "network latency metrics".to_string(),
            ],
            would_refute: vec!["all dependencies healthy".to_string()],
        });
    }

    hypotheses
}

/// Drop near-duplicate root causes, keeping the higher plausibility.
fn dedup(mut hypotheses: Vec<Hypothesis>) -> Vec<Hypothesis> {
    hypotheses.sort_by(|a, b| b.plausibility.total_cmp(&a.plausibility));
    let mut kept: Vec<Hypothesis> = Vec::new();
    for candidate in hypotheses {
        let duplicate = kept
            .iter()
            .any(|existing| token_overlap(&existing.root_cause, &candidate.root_cause) > DEDUP_OVERLAP);
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 3)
            .map(String::from)
            .collect()
    };
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_core::evidence::EvidencePayload;

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

    fn by_source(items: Vec<Evidence>) -> BTreeMap<SourceKind, Vec<Evidence>> {
        let mut map: BTreeMap<SourceKind, Vec<Evidence>> = BTreeMap::new();
        for ev in items {
            map.entry(ev.source()).or_default().push(ev);
        }
        map
    }

    fn generator() -> HypothesisGenerator {
        HypothesisGenerator::new(Arc::new(Config::default()), None)
    }

    #[tokio::test]
    async fn deployment_errors_pattern_leads() {
        let evidence = by_source(vec![
            log_evidence("deployment v2.1.5 rolled out"),
            log_evidence("HTTP 500 errors starting"),
        ]);
        let (hypotheses, _) = generator()
            .generate(&Timeline::default(), &evidence, &CancellationToken::new())
            .await;

        assert!(!hypotheses.is_empty());
        assert_eq!(hypotheses[0].id, "H1");
        assert!(hypotheses[0].root_cause.contains("deployment"));
        assert!(!hypotheses[0].supporting_evidence.is_empty());
    }

    #[tokio::test]
    async fn no_patterns_no_hypotheses() {
        let (hypotheses, _) = generator()
            .generate(
                &Timeline::default(),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(hypotheses.is_empty());
    }

    #[tokio::test]
    async fn ids_are_unique_and_ranked() {
        let evidence = by_source(vec![
            log_evidence("deployment finished"),
            log_evidence("OutOfMemoryError in ConnectionPool"),
            log_evidence("upstream request timed out"),
            log_evidence("HTTP 500 errors"),
        ]);
        let (hypotheses, _) = generator()
            .generate(&Timeline::default(), &evidence, &CancellationToken::new())
            .await;

        assert!(hypotheses.len() >= 2);
        let ids: HashSet<&str> = hypotheses.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids.len(), hypotheses.len());
        assert!(hypotheses
            .windows(2)
            .all(|pair| pair[0].plausibility >= pair[1].plausibility));
    }

    #[test]
    fn dedup_drops_rephrasings() {
        let near_duplicates = vec![
            Hypothesis {
                id: String::new(),
                root_cause: "Memory exhaustion degrading the service until crash".to_string(),
                plausibility: 0.8,
                supporting_evidence: vec![],
                required_evidence: vec![],
                would_refute: vec![],
            },
            Hypothesis {
                id: String::new(),
                root_cause: "Memory exhaustion degrading the service until failure".to_string(),
                plausibility: 0.6,
                supporting_evidence: vec![],
                required_evidence: vec![],
                would_refute: vec![],
            },
        ];
        let kept = dedup(near_duplicates);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].plausibility, 0.8);
    }

    #[test]
    fn enrichment_trigger() {
        let strong = Hypothesis {
            id: "H1".to_string(),
            root_cause: "a".to_string(),
            plausibility: 0.8,
            supporting_evidence: vec![],
            required_evidence: vec![],
            would_refute: vec![],
        };
        let weak = Hypothesis {
            id: "H2".to_string(),
            root_cause: "b".to_string(),
            plausibility: 0.3,
            supporting_evidence: vec![],
            required_evidence: vec![],
            would_refute: vec![],
        };

        let generator = generator();
        assert!(generator.needs_enrichment(&[strong.clone(), weak.clone()]));
        assert!(!generator.needs_enrichment(&[
            strong.clone(),
            Hypothesis {
                plausibility: 0.55,
                ..weak
            }
        ]));
    }

    #[test]
    fn evidence_ref_resolution() {
        let items = vec![log_evidence("one"), log_evidence("two")];
        let refs: Vec<&Evidence> = items.iter().collect();
        let resolved = resolve_evidence_refs(
            &["E1".to_string(), "E9".to_string(), "bogus".to_string()],
            &refs,
        );
        assert_eq!(resolved, vec![items[0].id]);
    }
}
