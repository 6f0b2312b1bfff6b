//! Tool-calling enrichment loop.
//!
//! A reasoning model is handed a fixed vocabulary of seven
//! observability tools and iterates: query, read results, refine -
//! until it is confident, the iteration budget runs out, or the
//! wall-clock budget expires. Tool failures are reported back into the
//! conversation as structured error results and never abort the loop.
//! The final synthesis is wrapped as tool-enrichment evidence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use verdict_backends::llm::ToolCall;
use verdict_backends::{
    ChatMessage, ChatRequest, ContentBlock, GrafanaClient, LlmClient, PrometheusClient, Role,
    StopReason, ToolDefinition,
};
use verdict_core::evidence::{Evidence, EvidencePayload};
use verdict_core::plan::Plan;
use verdict_core::Config;

use crate::prompts::ENRICHMENT_SYSTEM_PROMPT;

/// Confidence bounds for self-reported certainty.
const MIN_CERTAINTY: f64 = 0.3;
const MAX_CERTAINTY: f64 = 0.95;
const DEFAULT_CERTAINTY: f64 = 0.6;

/// Executes the fixed tool vocabulary against real backends. Split out
/// as a trait so the loop can run against scripted tools in tests.
#[async_trait]
pub trait ObservabilityTools: Send + Sync {
    /// Execute one tool call. Errors are encoded into the returned JSON
    /// (`{"error": ...}`) rather than propagated; calls must be
    /// idempotent from the caller's perspective.
    async fn execute(&self, call: &ToolCall) -> serde_json::Value;
}

/// Outcome of one enrichment loop.
#[derive(Debug, Default)]
pub struct EnrichmentOutcome {
    pub evidence: Vec<Evidence>,
    pub iterations: usize,
    pub tool_calls: usize,
    pub errors: Vec<String>,
}

pub struct EnrichmentLoop {
    config: Arc<Config>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ObservabilityTools>,
}

impl EnrichmentLoop {
    pub fn new(
        config: Arc<Config>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ObservabilityTools>,
    ) -> Self {
        Self { config, llm, tools }
    }

    /// Run the loop toward `goal`. `prior_summary` carries the evidence
    /// and hypotheses gathered so far.
    pub async fn run(
        &self,
        goal: &str,
        plan: &Plan,
        prior_summary: &str,
        cancel: &CancellationToken,
    ) -> EnrichmentOutcome {
        let mut outcome = EnrichmentOutcome::default();
        let deadline = Instant::now() + Duration::from_secs(self.config.tool_loop_budget_secs);

        let window = plan.observation_window();
        let system = format!(
            "{}\n\nIncident time: {}\nAnalysis window: {} to {}\nAffected services: {}",
            ENRICHMENT_SYSTEM_PROMPT,
            plan.incident_time.to_rfc3339(),
            window.start(plan.incident_time).to_rfc3339(),
            window.end(plan.incident_time).to_rfc3339(),
            if plan.affected_services.is_empty() {
                "unknown".to_string()
            } else {
                plan.affected_services.join(", ")
            }
        );

        let mut messages = vec![ChatMessage::user_text(format!(
            "Goal: {}\n\nWhat is known so far:\n{}",
            goal, prior_summary
        ))];

        while outcome.iterations < self.config.max_tool_iterations {
            if cancel.is_cancelled() {
                outcome.errors.push("enrichment loop cancelled".to_string());
                return outcome;
            }
            if Instant::now() >= deadline {
                outcome
                    .errors
                    .push("enrichment loop wall-clock budget expired".to_string());
                break;
            }
            outcome.iterations += 1;

            let request = ChatRequest::new(&self.config.llm_primary_model)
                .with_system(system.clone())
                .with_tools(tool_definitions())
                .with_max_tokens(4096);
            let request = messages
                .iter()
                .cloned()
                .fold(request, |req, msg| req.with_message(msg));

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.errors.push("enrichment loop cancelled".to_string());
                    return outcome;
                }
                response = self.llm.complete(request) => match response {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "enrichment model call failed");
                        outcome.errors.push(format!("enrichment model call failed: {}", e));
                        break;
                    }
                },
            };

            match response.stop_reason {
                StopReason::ToolUse => {
                    let calls = response.tool_calls();
                    outcome.tool_calls += calls.len();
                    debug!(
                        iteration = outcome.iterations,
                        calls = calls.len(),
                        "executing tool batch"
                    );

                    // Independent calls within one turn run concurrently.
                    let results =
                        join_all(calls.iter().map(|call| self.tools.execute(call))).await;

                    messages.push(ChatMessage::assistant(response.content.clone()));
                    let result_blocks: Vec<ContentBlock> = calls
                        .iter()
                        .zip(results)
                        .map(|(call, result)| ContentBlock::ToolResult {
                            tool_use_id: call.id.clone(),
                            is_error: result.get("error").is_some(),
                            content: result.to_string(),
                        })
                        .collect();
                    messages.push(ChatMessage {
                        role: Role::User,
                        content: result_blocks,
                    });
                }
                StopReason::EndTurn | StopReason::MaxTokens => {
                    let text = response.text();
                    if !text.trim().is_empty() {
                        let certainty = parse_certainty(&text)
                            .unwrap_or(DEFAULT_CERTAINTY)
                            .clamp(MIN_CERTAINTY, MAX_CERTAINTY);
                        outcome.evidence.push(Evidence::new(
                            strip_certainty_line(&text),
                            None,
                            certainty,
                            EvidencePayload::ToolEnrichment {
                                iterations: outcome.iterations,
                                tool_calls: outcome.tool_calls,
                                certainty,
                            },
                        ));
                    }
                    info!(
                        iterations = outcome.iterations,
                        tool_calls = outcome.tool_calls,
                        "enrichment loop finished"
                    );
                    return outcome;
                }
            }
        }

        if outcome.iterations >= self.config.max_tool_iterations {
            outcome
                .errors
                .push("enrichment loop iteration budget exhausted".to_string());
        }
        outcome
    }
}

/// Parse the trailing `certainty: NN%` line.
fn parse_certainty(text: &str) -> Option<f64> {
    for line in text.lines().rev() {
        let line = line.trim().to_lowercase();
        if let Some(rest) = line.strip_prefix("certainty:") {
            let rest = rest.trim().trim_end_matches('%');
            if let Ok(value) = rest.parse::<f64>() {
                return Some(if value > 1.0 { value / 100.0 } else { value });
            }
        }
    }
    None
}

fn strip_certainty_line(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().to_lowercase().starts_with("certainty:"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// The fixed seven-tool vocabulary.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "metrics_instant".to_string(),
            description: "Execute an instant PromQL query and return a single sample per series"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expr": {"type": "string", "description": "PromQL expression"},
                    "time": {"type": "string", "description": "Optional RFC3339 evaluation time"}
                },
                "required": ["expr"]
            }),
        },
        ToolDefinition {
            name: "metrics_range".to_string(),
            description: "Execute a range PromQL query and return a time series".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expr": {"type": "string"},
                    "start": {"type": "string", "description": "RFC3339 start"},
                    "end": {"type": "string", "description": "RFC3339 end"},
                    "step": {"type": "integer", "description": "Step seconds, default 60"}
                },
                "required": ["expr", "start", "end"]
            }),
        },
        ToolDefinition {
            name: "metrics_alerts".to_string(),
            description: "List currently firing alerts".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "metrics_targets".to_string(),
            description: "List active scrape targets and their health".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "dashboards_search".to_string(),
            description: "Search dashboards by free text and/or tags".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                }
            }),
        },
        ToolDefinition {
            name: "dashboard_get".to_string(),
            description: "Fetch full panel definitions for one dashboard".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"uid": {"type": "string"}},
                "required": ["uid"]
            }),
        },
        ToolDefinition {
            name: "dashboard_annotations".to_string(),
            description: "Fetch annotations within a time window".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "start": {"type": "string", "description": "RFC3339 start"},
                    "end": {"type": "string", "description": "RFC3339 end"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["start", "end"]
            }),
        },
    ]
}

// =============================================================================
// BACKEND EXECUTOR
// =============================================================================

/// Tool executor over the real metrics and dashboard clients.
pub struct BackendTools {
    prometheus: Option<Arc<PrometheusClient>>,
    grafana: Option<Arc<GrafanaClient>>,
}

impl BackendTools {
    pub fn new(
        prometheus: Option<Arc<PrometheusClient>>,
        grafana: Option<Arc<GrafanaClient>>,
    ) -> Self {
        Self { prometheus, grafana }
    }

    fn str_arg(input: &serde_json::Value, key: &str) -> Option<String> {
        input.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    fn time_arg(input: &serde_json::Value, key: &str) -> Option<DateTime<Utc>> {
        Self::str_arg(input, key).and_then(|s| s.parse().ok())
    }

    fn tags_arg(input: &serde_json::Value) -> Vec<String> {
        input
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObservabilityTools for BackendTools {
    async fn execute(&self, call: &ToolCall) -> serde_json::Value {
        let input = &call.input;
        match call.name.as_str() {
            "metrics_instant" | "metrics_range" | "metrics_alerts" | "metrics_targets" => {
                let client = match &self.prometheus {
                    Some(client) => client,
                    None => return json!({"error": "metrics backend not configured"}),
                };
                match call.name.as_str() {
                    "metrics_instant" => {
                        let expr = match Self::str_arg(input, "expr") {
                            Some(expr) => expr,
                            None => return json!({"error": "missing required field: expr"}),
                        };
                        match client.query(&expr, Self::time_arg(input, "time")).await {
                            Ok(samples) => json!({
                                "samples": samples.iter().map(|s| json!({
                                    "labels": s.metric,
                                    "time": s.timestamp.to_rfc3339(),
                                    "value": s.value,
                                })).collect::<Vec<_>>()
                            }),
                            Err(e) => json!({"error": e.to_string()}),
                        }
                    }
                    "metrics_range" => {
                        let expr = match Self::str_arg(input, "expr") {
                            Some(expr) => expr,
                            None => return json!({"error": "missing required field: expr"}),
                        };
                        let (start, end) = match (
                            Self::time_arg(input, "start"),
                            Self::time_arg(input, "end"),
                        ) {
                            (Some(start), Some(end)) => (start, end),
                            _ => return json!({"error": "start and end must be RFC3339 times"}),
                        };
                        let step = input.get("step").and_then(|v| v.as_u64()).unwrap_or(60);
                        match client.query_range(&expr, start, end, step).await {
                            Ok(series) => json!({
                                "series": series.iter().map(|s| json!({
                                    "labels": s.metric,
                                    "samples": s.samples.iter().map(|(t, v)| {
                                        json!([t.to_rfc3339(), v])
                                    }).collect::<Vec<_>>(),
                                })).collect::<Vec<_>>()
                            }),
                            Err(e) => json!({"error": e.to_string()}),
                        }
                    }
                    "metrics_alerts" => match client.alerts().await {
                        Ok(alerts) => json!({
                            "alerts": alerts.iter().map(|a| json!({
                                "labels": a.labels,
                                "state": a.state,
                                "active_at": a.active_at,
                            })).collect::<Vec<_>>()
                        }),
                        Err(e) => json!({"error": e.to_string()}),
                    },
                    _ => match client.targets().await {
                        Ok(targets) => json!({
                            "targets": targets.iter().map(|t| json!({
                                "labels": t.labels,
                                "health": t.health,
                                "last_error": t.last_error,
                            })).collect::<Vec<_>>()
                        }),
                        Err(e) => json!({"error": e.to_string()}),
                    },
                }
            }
            "dashboards_search" | "dashboard_get" | "dashboard_annotations" => {
                let client = match &self.grafana {
                    Some(client) => client,
                    None => return json!({"error": "dashboard backend not configured"}),
                };
                match call.name.as_str() {
                    "dashboards_search" => {
                        let query = Self::str_arg(input, "query");
                        match client.search(query.as_deref(), &Self::tags_arg(input)).await {
                            Ok(hits) => json!({
                                "dashboards": hits.iter().map(|h| json!({
                                    "uid": h.uid,
                                    "title": h.title,
                                    "tags": h.tags,
                                })).collect::<Vec<_>>()
                            }),
                            Err(e) => json!({"error": e.to_string()}),
                        }
                    }
                    "dashboard_get" => {
                        let uid = match Self::str_arg(input, "uid") {
                            Some(uid) => uid,
                            None => return json!({"error": "missing required field: uid"}),
                        };
                        match client.dashboard(&uid).await {
                            Ok(detail) => json!({
                                "uid": detail.uid,
                                "title": detail.title,
                                "panels": detail.panels.iter().map(|p| json!({
                                    "id": p.id,
                                    "title": p.title,
                                    "type": p.kind,
                                })).collect::<Vec<_>>()
                            }),
                            Err(e) => json!({"error": e.to_string()}),
                        }
                    }
                    _ => {
                        let (start, end) = match (
                            Self::time_arg(input, "start"),
                            Self::time_arg(input, "end"),
                        ) {
                            (Some(start), Some(end)) => (start, end),
                            _ => return json!({"error": "start and end must be RFC3339 times"}),
                        };
                        match client
                            .annotations(
                                start.timestamp_millis(),
                                end.timestamp_millis(),
                                &Self::tags_arg(input),
                            )
                            .await
                        {
                            Ok(annotations) => json!({
                                "annotations": annotations.iter().map(|a| json!({
                                    "time": Utc.timestamp_millis_opt(a.time)
                                        .single()
                                        .map(|t| t.to_rfc3339()),
                                    "tags": a.tags,
                                    "text": a.text,
                                })).collect::<Vec<_>>()
                            }),
                            Err(e) => json!({"error": e.to_string()}),
                        }
                    }
                }
            }
            other => json!({"error": format!("unknown tool: {}", other)}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use verdict_core::plan::{AgentName, Priority, SearchWindow};

    fn plan() -> Plan {
        let mut windows = BTreeMap::new();
        windows.insert(AgentName::Metrics, SearchWindow::symmetric(30));
        Plan {
            incident_time: chrono::Utc
                .with_ymd_and_hms(2024, 1, 15, 14, 32, 0)
                .unwrap(),
            affected_services: vec!["api-gateway".to_string()],
            symptoms: vec![],
            search_windows: windows,
            required_agents: vec![AgentName::Metrics],
            priority: Priority::High,
        }
    }

    /// Scripted model: emits each canned response in turn.
    struct ScriptedLlm {
        responses: Mutex<Vec<verdict_backends::ChatResponse>>,
    }

    impl ScriptedLlm {
        fn new(mut responses: Vec<verdict_backends::ChatResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _request: ChatRequest,
        ) -> Result<verdict_backends::ChatResponse, verdict_backends::LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or(verdict_backends::LlmError::NotConfigured)
        }
    }

    /// Scripted tools: always succeed, recording calls.
    struct RecordingTools {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ObservabilityTools for RecordingTools {
        async fn execute(&self, call: &ToolCall) -> serde_json::Value {
            self.calls.lock().unwrap().push(call.name.clone());
            if self.fail {
                json!({"error": "backend exploded"})
            } else {
                json!({"ok": true})
            }
        }
    }

    fn tool_use_response(names: &[&str]) -> verdict_backends::ChatResponse {
        verdict_backends::ChatResponse {
            content: names
                .iter()
                .enumerate()
                .map(|(i, name)| ContentBlock::ToolUse {
                    id: format!("toolu_{}", i),
                    name: name.to_string(),
                    input: json!({"expr": "up", "start": "2024-01-15T14:00:00Z", "end": "2024-01-15T15:00:00Z"}),
                })
                .collect(),
            stop_reason: StopReason::ToolUse,
        }
    }

    fn done_response(text: &str) -> verdict_backends::ChatResponse {
        verdict_backends::ChatResponse {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            stop_reason: StopReason::EndTurn,
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    #[tokio::test]
    async fn loop_executes_tools_then_wraps_synthesis() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_use_response(&["metrics_range", "dashboard_annotations"]),
            done_response("Error rate alert fired at 14:31.\ncertainty: 84%"),
        ]));
        let tools = Arc::new(RecordingTools {
            calls: Mutex::new(vec![]),
            fail: false,
        });
        let looper = EnrichmentLoop::new(config(), llm, tools.clone());

        let outcome = looper
            .run("confirm error spike", &plan(), "weak evidence", &CancellationToken::new())
            .await;

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 2);
        assert_eq!(outcome.evidence.len(), 1);
        let ev = &outcome.evidence[0];
        assert!((ev.confidence - 0.84).abs() < 1e-9);
        assert!(!ev.content.contains("certainty"));
        assert_eq!(
            tools.calls.lock().unwrap().as_slice(),
            ["metrics_range", "dashboard_annotations"]
        );
    }

    #[tokio::test]
    async fn tool_errors_do_not_abort_the_loop() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_use_response(&["metrics_instant"]),
            done_response("Backend was down, no further data.\ncertainty: 20%"),
        ]));
        let tools = Arc::new(RecordingTools {
            calls: Mutex::new(vec![]),
            fail: true,
        });
        let looper = EnrichmentLoop::new(config(), llm, tools);

        let outcome = looper
            .run("anything", &plan(), "", &CancellationToken::new())
            .await;

        // Loop continued past the failing tool and produced evidence,
        // clamped to the certainty floor.
        assert_eq!(outcome.evidence.len(), 1);
        assert!((outcome.evidence[0].confidence - MIN_CERTAINTY).abs() < 1e-9);
    }

    #[tokio::test]
    async fn iteration_budget_bounds_the_loop() {
        let mut config = Config::default();
        config.max_tool_iterations = 3;
        let responses = (0..10).map(|_| tool_use_response(&["metrics_alerts"])).collect();
        let llm = Arc::new(ScriptedLlm::new(responses));
        let tools = Arc::new(RecordingTools {
            calls: Mutex::new(vec![]),
            fail: false,
        });
        let looper = EnrichmentLoop::new(Arc::new(config), llm, tools);

        let outcome = looper
            .run("never finishes", &plan(), "", &CancellationToken::new())
            .await;

        assert_eq!(outcome.iterations, 3);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("iteration budget")));
        assert!(outcome.evidence.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_reports_structured_error() {
        let tools = BackendTools::new(None, None);
        let result = tools
            .execute(&ToolCall {
                id: "toolu_1".to_string(),
                name: "rm_rf_slash".to_string(),
                input: json!({}),
            })
            .await;
        assert!(result["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[test]
    fn certainty_parsing() {
        assert_eq!(parse_certainty("text\ncertainty: 84%"), Some(0.84));
        assert_eq!(parse_certainty("text\nCertainty: 0.5"), Some(0.5));
        assert_eq!(parse_certainty("no line"), None);
    }

    #[test]
    fn exactly_seven_tools() {
        let tools = tool_definitions();
        assert_eq!(tools.len(), 7);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "metrics_instant",
                "metrics_range",
                "metrics_alerts",
                "metrics_targets",
                "dashboards_search",
                "dashboard_get",
                "dashboard_annotations"
            ]
        );
    }
}
