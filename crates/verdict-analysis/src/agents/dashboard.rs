//! Dashboard agent: dashboards and annotations around the incident.
//!
//! Searches the dashboard backend by service tags, summarizes matching
//! dashboards and their panels, and pulls annotations (deploy markers,
//! alert notes) inside the incident window.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracing::debug;

use verdict_backends::GrafanaClient;
use verdict_core::evidence::{DashboardItemKind, Evidence, EvidencePayload};
use verdict_core::plan::AgentName;
use verdict_core::state::EvidencePatch;
use verdict_core::{Config, Result};

use super::{AgentContext, EvidenceAgent};

/// Panel definitions are fetched for at most this many dashboards.
const MAX_DETAILED_DASHBOARDS: usize = 3;

pub struct DashboardAgent {
    #[allow(dead_code)]
    config: Arc<Config>,
    grafana: Option<Arc<GrafanaClient>>,
}

impl DashboardAgent {
    pub fn new(config: Arc<Config>, grafana: Option<Arc<GrafanaClient>>) -> Self {
        Self { config, grafana }
    }
}

#[async_trait]
impl EvidenceAgent for DashboardAgent {
    fn name(&self) -> AgentName {
        AgentName::Dashboard
    }

    async fn collect(&self, ctx: AgentContext) -> Result<EvidencePatch> {
        let client = match &self.grafana {
            Some(client) => client.clone(),
            None => {
                return Ok(EvidencePatch::with_error(
                    "dashboard backend not configured",
                ))
            }
        };

        let plan = &ctx.plan;
        let window = plan.window_for(AgentName::Dashboard);
        let mut evidence = Vec::new();
        let mut errors = Vec::new();

        // Search once per service tag, plus an untagged search when no
        // services were identified.
        let mut seen: HashSet<String> = HashSet::new();
        let tag_sets: Vec<Vec<String>> = if plan.affected_services.is_empty() {
            vec![Vec::new()]
        } else {
            plan.affected_services
                .iter()
                .map(|s| vec![s.clone()])
                .collect()
        };

        for tags in &tag_sets {
            if ctx.cancel.is_cancelled() {
                return Ok(EvidencePatch { evidence, errors });
            }
            match client.search(None, tags).await {
                Ok(hits) => {
                    for hit in hits {
                        if !seen.insert(hit.uid.clone()) {
                            continue;
                        }
                        let mut content = format!("Dashboard '{}'", hit.title);
                        if !hit.tags.is_empty() {
                            content.push_str(&format!(" (tags: {})", hit.tags.join(", ")));
                        }

                        if seen.len() <= MAX_DETAILED_DASHBOARDS {
                            match client.dashboard(&hit.uid).await {
                                Ok(detail) if !detail.panels.is_empty() => {
                                    let panels: Vec<&str> = detail
                                        .panels
                                        .iter()
                                        .map(|p| p.title.as_str())
                                        .filter(|t| !t.is_empty())
                                        .take(6)
                                        .collect();
                                    content.push_str(&format!(
                                        " with panels: {}",
                                        panels.join(", ")
                                    ));
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    errors.push(format!(
                                        "panel fetch failed for {}: {}",
                                        hit.uid, e
                                    ));
                                }
                            }
                        }

                        evidence.push(Evidence::new(
                            content,
                            None,
                            0.55,
                            EvidencePayload::Dashboard {
                                uid: Some(hit.uid.clone()),
                                title: hit.title.clone(),
                                kind: DashboardItemKind::Dashboard,
                                tags: hit.tags.clone(),
                            },
                        ));
                    }
                }
                Err(e) => errors.push(format!("dashboard search failed: {}", e)),
            }
        }

        // Annotations in the incident window carry real timestamps and
        // are the strongest dashboard-side evidence.
        let from_ms = window.start(plan.incident_time).timestamp_millis();
        let to_ms = window.end(plan.incident_time).timestamp_millis();
        match client
            .annotations(from_ms, to_ms, &plan.affected_services)
            .await
        {
            Ok(annotations) => {
                for ann in annotations {
                    let time = Utc.timestamp_millis_opt(ann.time).single();
                    let label = if ann.text.is_empty() {
                        format!("annotation [{}]", ann.tags.join(", "))
                    } else {
                        ann.text.clone()
                    };
                    evidence.push(Evidence::new(
                        label.clone(),
                        time,
                        0.85,
                        EvidencePayload::Dashboard {
                            uid: None,
                            title: label,
                            kind: DashboardItemKind::Annotation,
                            tags: ann.tags.clone(),
                        },
                    ));
                }
            }
            Err(e) => errors.push(format!("annotation fetch failed: {}", e)),
        }

        debug!(count = evidence.len(), "dashboard collection complete");
        Ok(EvidencePatch { evidence, errors })
    }
}
