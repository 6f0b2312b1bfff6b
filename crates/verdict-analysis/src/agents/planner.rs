//! Planner: derives the execution plan from the incident request.
//!
//! Preferred path is one schema-constrained model call; the
//! deterministic fallback extracts services, symptoms, and time hints
//! directly from the query. The planner never fails a run: under every
//! failure mode it still produces a usable plan and records a note.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use verdict_backends::{ChatMessage, ChatRequest, LlmClient};
use verdict_core::plan::{AgentName, Plan, Priority, SearchWindow, Symptom};
use verdict_core::state::AnalysisRequest;
use verdict_core::{Config, Error, Result};

use crate::prompts::PLANNER_PROMPT;

/// Service names the deterministic path recognizes without hints.
const KNOWN_SERVICES: &[&str] = &[
    "api-gateway",
    "auth-service",
    "payment-service",
    "postgres",
    "redis",
    "kafka",
    "ingress",
    "frontend",
];

/// Shape the model is asked to produce.
#[derive(Debug, Deserialize)]
struct PlanDraft {
    #[serde(default)]
    affected_services: Vec<String>,
    #[serde(default)]
    symptoms: Vec<String>,
    #[serde(default)]
    required_agents: Vec<String>,
    #[serde(default)]
    priority: Option<String>,
}

pub struct Planner {
    config: Arc<Config>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Planner {
    pub fn new(config: Arc<Config>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    /// Produce a plan. Returns the plan together with any non-fatal
    /// notes (model unavailable, malformed output).
    pub async fn plan(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> (Plan, Vec<String>) {
        let mut notes = Vec::new();

        let draft = match &self.llm {
            Some(llm) if !cancel.is_cancelled() => {
                match self.llm_draft(llm.as_ref(), request, cancel).await {
                    Ok(draft) => Some(draft),
                    Err(e) => {
                        warn!(error = %e, "planner model path failed, using deterministic extraction");
                        notes.push(format!("planner fell back to rule-based extraction: {}", e));
                        None
                    }
                }
            }
            _ => None,
        };

        let plan = self.assemble(request, draft);
        info!(
            services = ?plan.affected_services,
            symptoms = ?plan.symptoms,
            agents = ?plan.required_agents,
            priority = ?plan.priority,
            "plan derived"
        );
        (plan, notes)
    }

    async fn llm_draft(
        &self,
        llm: &dyn LlmClient,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<PlanDraft> {
        let prompt = format!(
            "{}\n\nQuery: {}\nTimestamp: {}\nService hints: {}",
            PLANNER_PROMPT,
            request.query,
            request.timestamp.to_rfc3339(),
            if request.services.is_empty() {
                "none".to_string()
            } else {
                request.services.join(", ")
            }
        );

        let chat = ChatRequest::new(&self.config.llm_primary_model)
            .with_message(ChatMessage::user_text(prompt))
            .with_max_tokens(1024);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = llm.complete(chat) => response.map_err(|e| Error::model(e.to_string()))?,
        };

        let text = response.text();
        let json = strip_code_fences(&text);
        serde_json::from_str(json).map_err(|e| Error::model(format!("unparseable plan: {}", e)))
    }

    /// Merge the draft (if any) with deterministic extraction and derive
    /// windows, agents, and priority.
    fn assemble(&self, request: &AnalysisRequest, draft: Option<PlanDraft>) -> Plan {
        let query_lower = request.query.to_lowercase();

        // Symptoms: model output first, always backstopped by keywords.
        let mut symptoms: Vec<Symptom> = draft
            .as_ref()
            .map(|d| {
                d.symptoms
                    .iter()
                    .filter_map(|s| Symptom::from_tag(s))
                    .collect()
            })
            .unwrap_or_default();
        for symptom in Symptom::ALL {
            if symptom
                .keywords()
                .iter()
                .any(|kw| query_lower.contains(kw))
                && !symptoms.contains(&symptom)
            {
                symptoms.push(symptom);
            }
        }
        symptoms.sort();

        // Services: hints first, then model output, then the closed
        // vocabulary and hyphenated tokens in the query.
        let mut services: Vec<String> = request.services.clone();
        if let Some(d) = &draft {
            for s in &d.affected_services {
                push_unique(&mut services, s);
            }
        }
        for known in KNOWN_SERVICES {
            if query_lower.contains(known) {
                push_unique(&mut services, known);
            }
        }
        for token in service_like_tokens(&query_lower) {
            push_unique(&mut services, &token);
        }

        let incident_time = refine_incident_time(&request.query, request.timestamp);

        let mut required = self.required_agents(request, &symptoms);
        if let Some(d) = &draft {
            for name in d.required_agents.iter().filter_map(|s| AgentName::from_tag(s)) {
                // The image agent is only useful with attachments,
                // whatever the model says.
                if name == AgentName::Image && request.dashboard_images.is_empty() {
                    continue;
                }
                if !required.contains(&name) {
                    required.push(name);
                }
            }
        }
        required.sort();

        let mut windows = BTreeMap::new();
        for agent in &required {
            windows.insert(*agent, SearchWindow::default_for(*agent));
        }

        let priority = draft
            .as_ref()
            .and_then(|d| d.priority.as_deref())
            .and_then(parse_priority)
            .unwrap_or_else(|| derive_priority(&symptoms));

        debug!(incident_time = %incident_time, "planner assembled windows for {} agents", required.len());

        Plan {
            incident_time,
            affected_services: services,
            symptoms,
            search_windows: windows,
            required_agents: required,
            priority,
        }
    }

    fn required_agents(&self, request: &AnalysisRequest, symptoms: &[Symptom]) -> Vec<AgentName> {
        let mut agents = vec![AgentName::Log, AgentName::Rag];

        let metrics_worthy = symptoms.iter().any(|s| {
            matches!(
                s,
                Symptom::Latency
                    | Symptom::ErrorRate
                    | Symptom::Cpu
                    | Symptom::Memory
                    | Symptom::Crash
            )
        });
        if metrics_worthy || !request.services.is_empty() {
            agents.push(AgentName::Metrics);
            agents.push(AgentName::Dashboard);
        } else if symptoms.contains(&Symptom::Deployment) {
            agents.push(AgentName::Dashboard);
        }

        if !request.dashboard_images.is_empty() {
            agents.push(AgentName::Image);
        }

        agents
    }
}

fn push_unique(services: &mut Vec<String>, candidate: &str) {
    let normalized = candidate.trim().to_ascii_lowercase();
    if !normalized.is_empty() && !services.contains(&normalized) {
        services.push(normalized);
    }
}

/// Hyphenated identifiers in the query read as service names
/// ("checkout-api", "orders-worker").
fn service_like_tokens(query: &str) -> Vec<String> {
    let re = Regex::new(r"\b[a-z][a-z0-9]*(?:-[a-z0-9]+)+\b").expect("static regex");
    re.find_iter(query)
        .map(|m| m.as_str().to_string())
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit() || c == '-'))
        .collect()
}

/// Prefer an explicit HH:MM mention in the query over the request
/// timestamp's time of day; the request timestamp stays authoritative
/// for the date.
fn refine_incident_time(query: &str, timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let re = Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)(?::([0-5]\d))?\s*(?:utc)?\b")
        .expect("static regex");
    if let Some(caps) = re.captures(&query.to_lowercase()) {
        let hour: u32 = caps[1].parse().unwrap_or(0);
        let minute: u32 = caps[2].parse().unwrap_or(0);
        let second: u32 = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        if let Some(time) = NaiveTime::from_hms_opt(hour, minute, second) {
            return timestamp.date_naive().and_time(time).and_utc();
        }
    }
    timestamp
}

fn parse_priority(raw: &str) -> Option<Priority> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" => Some(Priority::Low),
        "medium" => Some(Priority::Medium),
        "high" => Some(Priority::High),
        _ => None,
    }
}

fn derive_priority(symptoms: &[Symptom]) -> Priority {
    if symptoms
        .iter()
        .any(|s| matches!(s, Symptom::Crash | Symptom::ErrorRate))
    {
        Priority::High
    } else if symptoms.iter().any(|s| {
        matches!(
            s,
            Symptom::Latency | Symptom::Cpu | Symptom::Memory | Symptom::Network
        )
    }) {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Strip markdown code fences the model may wrap JSON in.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim().trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim().trim_end_matches("```").trim()
    } else {
        trimmed
    }
}
