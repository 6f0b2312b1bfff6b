//! RAG agent: similarity search over historical incidents and runbooks.
//!
//! Two sub-searches against the vector index, each with its own
//! similarity floor. A missing index is a recorded, non-fatal condition
//! and yields empty evidence.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use verdict_backends::{Corpus, SearchHit, VectorIndex};
use verdict_core::evidence::{Evidence, EvidencePayload, RagCorpus};
use verdict_core::plan::AgentName;
use verdict_core::state::EvidencePatch;
use verdict_core::{Config, Result};

use super::{AgentContext, EvidenceAgent};

pub struct RagAgent {
    config: Arc<Config>,
    vector: Option<Arc<dyn VectorIndex>>,
}

impl RagAgent {
    pub fn new(config: Arc<Config>, vector: Option<Arc<dyn VectorIndex>>) -> Self {
        Self { config, vector }
    }

    fn query_text(&self, ctx: &AgentContext) -> String {
        let mut parts: Vec<String> = ctx
            .plan
            .symptoms
            .iter()
            .map(|s| s.as_str().replace('_', " "))
            .collect();
        parts.extend(ctx.plan.affected_services.iter().cloned());
        if parts.is_empty() {
            ctx.request.query.clone()
        } else {
            parts.join(" ")
        }
    }

    fn hit_to_evidence(hit: &SearchHit, corpus: RagCorpus) -> Evidence {
        let title = hit
            .payload
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(hit.id.as_str());
        let summary = hit.payload.get("summary").and_then(|v| v.as_str());

        let content = match (corpus, summary) {
            (RagCorpus::Incidents, Some(summary)) => {
                format!("{}: {}: {}", hit.id, title, summary)
            }
            (RagCorpus::Incidents, None) => format!("{}: {}", hit.id, title),
            (RagCorpus::Runbooks, Some(summary)) => format!("Runbook '{}': {}", title, summary),
            (RagCorpus::Runbooks, None) => format!("Runbook '{}'", title),
        };

        Evidence::new(
            content,
            None,
            hit.similarity,
            EvidencePayload::Rag {
                corpus,
                document_id: hit.id.clone(),
                similarity: hit.similarity,
            },
        )
    }
}

#[async_trait]
impl EvidenceAgent for RagAgent {
    fn name(&self) -> AgentName {
        AgentName::Rag
    }

    async fn collect(&self, ctx: AgentContext) -> Result<EvidencePatch> {
        let index = match &self.vector {
            Some(index) => index,
            None => {
                return Ok(EvidencePatch::with_error(
                    "historical incident index unavailable",
                ))
            }
        };

        let query = self.query_text(&ctx);
        let embedding = match index.embed(&query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                return Ok(EvidencePatch::with_error(format!(
                    "embedding failed: {}",
                    e
                )))
            }
        };

        let mut evidence = Vec::new();
        let mut errors = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (corpus, wire, floor) in [
            (
                Corpus::Incidents,
                RagCorpus::Incidents,
                self.config.incident_min_similarity,
            ),
            (
                Corpus::Runbooks,
                RagCorpus::Runbooks,
                self.config.runbook_min_similarity,
            ),
        ] {
            match index
                .search(corpus, &embedding, self.config.rag_top_k, &Default::default())
                .await
            {
                Ok(hits) => {
                    for hit in hits {
                        if hit.similarity < floor {
                            continue;
                        }
                        // Dedup by source document across both searches.
                        if !seen.insert(hit.id.clone()) {
                            continue;
                        }
                        evidence.push(Self::hit_to_evidence(&hit, wire));
                    }
                }
                Err(e) => errors.push(format!("{} search failed: {}", corpus.as_str(), e)),
            }
        }

        evidence.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        debug!(count = evidence.len(), "rag retrieval complete");
        Ok(EvidencePatch { evidence, errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;
    use verdict_backends::InMemoryIndex;
    use verdict_core::plan::{Plan, Priority, SearchWindow, Symptom};
    use verdict_core::state::{AnalysisRequest, RawAnalysisRequest};

    fn context() -> AgentContext {
        let request = AnalysisRequest::from_raw(RawAnalysisRequest {
            query: "memory leak after deployment".to_string(),
            timestamp: Some("2024-01-15T14:32:00Z".to_string()),
            ..Default::default()
        })
        .unwrap();

        let mut windows = BTreeMap::new();
        windows.insert(AgentName::Rag, SearchWindow::default_for(AgentName::Rag));
        let plan = Plan {
            incident_time: chrono::Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 0).unwrap(),
            affected_services: vec!["api-gateway".to_string()],
            symptoms: vec![Symptom::Memory, Symptom::Deployment],
            search_windows: windows,
            required_agents: vec![AgentName::Rag],
            priority: Priority::High,
        };

        AgentContext::new(Arc::new(request), Arc::new(plan), CancellationToken::new())
    }

    fn populated_index() -> InMemoryIndex {
        let mut index = InMemoryIndex::new();
        index.insert(
            Corpus::Incidents,
            "INC-2023-089",
            "memory leak in connection pool after deployment api-gateway",
            serde_json::json!({
                "title": "Memory leak in connection pool",
                "summary": "bad deploy leaked connections until OOM"
            }),
        );
        index.insert(
            Corpus::Runbooks,
            "rb-memory",
            "memory exhaustion triage runbook deployment rollback api-gateway",
            serde_json::json!({"title": "Memory exhaustion triage"}),
        );
        index.insert(
            Corpus::Incidents,
            "INC-2022-001",
            "dns resolution outage in eu region",
            serde_json::json!({"title": "DNS outage"}),
        );
        index
    }

    #[tokio::test]
    async fn missing_index_is_nonfatal() {
        let agent = RagAgent::new(Arc::new(Config::default()), None);
        let patch = agent.collect(context()).await.unwrap();
        assert!(patch.evidence.is_empty());
        assert_eq!(patch.errors.len(), 1);
    }

    #[tokio::test]
    async fn floors_filter_weak_matches() {
        let agent = RagAgent::new(
            Arc::new(Config::default()),
            Some(Arc::new(populated_index())),
        );
        let patch = agent.collect(context()).await.unwrap();

        assert!(!patch.evidence.is_empty());
        // The unrelated DNS incident must not clear the 0.5 floor.
        assert!(patch
            .evidence
            .iter()
            .all(|ev| !ev.content.contains("DNS outage")));
        for ev in &patch.evidence {
            match &ev.payload {
                EvidencePayload::Rag { similarity, corpus, .. } => {
                    let floor = match corpus {
                        RagCorpus::Incidents => 0.5,
                        RagCorpus::Runbooks => 0.4,
                    };
                    assert!(*similarity >= floor);
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn incident_content_carries_document_id() {
        let agent = RagAgent::new(
            Arc::new(Config::default()),
            Some(Arc::new(populated_index())),
        );
        let patch = agent.collect(context()).await.unwrap();
        assert!(patch
            .evidence
            .iter()
            .any(|ev| ev.content.starts_with("INC-2023-089")));
    }
}
