//! The verdict pipeline orchestrator.
//!
//! Owns the per-run state exclusively. A run proceeds Planner → five
//! evidence agents in parallel → Timeline → Hypotheses → Verifier →
//! Decision; agents receive immutable snapshots and their patches are
//! applied serially at the fan-in barrier, so no agent ever observes
//! another's partial output. Every node completion publishes a stage
//! event for streaming transports.
//!
//! Timeouts are layered: a per-agent soft timeout converts a stuck
//! agent into an empty result with a recorded error, and a per-run hard
//! deadline aborts the pipeline into a refuse verdict. A cancellation
//! token threads through every agent and backend call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use verdict_analysis::agents::{
    AgentContext, DashboardAgent, EvidenceAgent, ImageAgent, LogAgent, MetricsAgent, Planner,
    RagAgent,
};
use verdict_analysis::{
    BackendTools, DecisionGate, EnrichmentLoop, HypothesisGenerator, TimelineCorrelator, Verifier,
};
use verdict_backends::{GrafanaClient, LlmClient, PrometheusClient, VectorIndex};
use verdict_core::events::{ProgressEvent, Stage, StageEvent, StageStatus};
use verdict_core::plan::{AgentName, Plan};
use verdict_core::response::{AnalysisResponse, Decision, EvidenceBundle, TimelineEntry};
use verdict_core::state::{AgentRecord, AnalysisRequest, RawAnalysisRequest, RunState};
use verdict_core::{Config, Error, Result};

/// Capacity of the progress event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// External backends handed to the orchestrator. Any of them may be
/// absent; the corresponding agents then record soft failures.
#[derive(Default)]
pub struct Backends {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub prometheus: Option<Arc<PrometheusClient>>,
    pub grafana: Option<Arc<GrafanaClient>>,
    pub vector: Option<Arc<dyn VectorIndex>>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    planner: Planner,
    agents: Vec<Arc<dyn EvidenceAgent>>,
    correlator: TimelineCorrelator,
    generator: HypothesisGenerator,
    verifier: Verifier,
    gate: DecisionGate,
    enrichment: Option<Arc<EnrichmentLoop>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl Orchestrator {
    /// Wire the standard pipeline over the given backends.
    pub fn new(config: Arc<Config>, backends: Backends) -> Self {
        let agents: Vec<Arc<dyn EvidenceAgent>> = vec![
            Arc::new(LogAgent::new(config.clone(), backends.vector.clone())),
            Arc::new(RagAgent::new(config.clone(), backends.vector.clone())),
            Arc::new(MetricsAgent::new(config.clone(), backends.prometheus.clone())),
            Arc::new(DashboardAgent::new(config.clone(), backends.grafana.clone())),
            Arc::new(ImageAgent::new(config.clone(), backends.llm.clone())),
        ];

        let enrichment = backends.llm.clone().map(|llm| {
            Arc::new(EnrichmentLoop::new(
                config.clone(),
                llm,
                Arc::new(BackendTools::new(
                    backends.prometheus.clone(),
                    backends.grafana.clone(),
                )),
            ))
        });

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            planner: Planner::new(config.clone(), backends.llm.clone()),
            correlator: TimelineCorrelator::new(&config),
            generator: HypothesisGenerator::new(config.clone(), backends.llm.clone()),
            verifier: Verifier::new(config.clone()),
            gate: DecisionGate::new(config.clone()),
            agents,
            enrichment,
            events,
            config,
        }
    }

    /// Replace the evidence agents (used by tests and embedders).
    pub fn with_agents(mut self, agents: Vec<Arc<dyn EvidenceAgent>>) -> Self {
        self.agents = agents;
        self
    }

    /// Replace the enrichment loop (used by tests and embedders).
    pub fn with_enrichment(mut self, enrichment: Option<Arc<EnrichmentLoop>>) -> Self {
        self.enrichment = enrichment;
        self
    }

    /// Subscribe to stage-completion events for all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Analyze one incident request end to end.
    pub async fn analyze(&self, raw: RawAnalysisRequest) -> Result<AnalysisResponse> {
        self.analyze_with_cancel(raw, CancellationToken::new()).await
    }

    /// Analyze with a caller-held cancellation token; cancellation is
    /// honored at the next suspension point.
    pub async fn analyze_with_cancel(
        &self,
        raw: RawAnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResponse> {
        // Input errors surface synchronously, before the pipeline.
        let request = AnalysisRequest::from_raw(raw)?;
        ::metrics::counter!("verdict_runs_total").increment(1);

        let state = Arc::new(Mutex::new(RunState::new(request)));
        let analysis_id = state.lock().await.analysis_id;
        info!(analysis_id = %analysis_id, "analysis run started");

        let deadline = Duration::from_secs(self.config.run_timeout_secs);
        let pipeline = self.pipeline(state.clone(), cancel.clone());

        match tokio::time::timeout(deadline, pipeline).await {
            Ok(Ok(())) => {
                let st = state.lock().await;
                st.response
                    .clone()
                    .ok_or_else(|| Error::invariant("pipeline finished without a response"))
            }
            Ok(Err(e)) => {
                error!(analysis_id = %analysis_id, error = %e, "analysis run failed");
                Err(e)
            }
            Err(_) => {
                // Hard deadline: abort everything and refuse.
                cancel.cancel();
                ::metrics::counter!("verdict_runs_timed_out_total").increment(1);
                warn!(analysis_id = %analysis_id, "run exceeded hard deadline");

                let mut st = state.lock().await;
                st.errors.push("timeout".to_string());
                let response = AnalysisResponse {
                    analysis_id: st.analysis_id.to_string(),
                    status: Decision::Refuse,
                    confidence: 0.0,
                    root_cause: None,
                    evidence: None,
                    timeline: None,
                    recommended_actions: None,
                    alternative_hypotheses: None,
                    missing_evidence: None,
                    processing_time_ms: elapsed_ms(&st),
                    agent_history: st.agent_history.clone(),
                    errors: Some(st.errors.clone()),
                };
                st.response = Some(response.clone());
                let _ = self.events.send(ProgressEvent::Completed {
                    analysis_id,
                    response: Box::new(response.clone()),
                });
                Ok(response)
            }
        }
    }

    async fn pipeline(&self, state: Arc<Mutex<RunState>>, cancel: CancellationToken) -> Result<()> {
        let analysis_id = state.lock().await.analysis_id;

        // ---- Stage 1: planner (never fails the run) ----
        let request = Arc::new(state.lock().await.request.clone());
        let started = Utc::now();
        let (plan, notes) = self.planner.plan(request.as_ref(), &cancel).await;
        plan.validate()?;
        let plan = Arc::new(plan);
        {
            let mut st = state.lock().await;
            st.errors.extend(notes);
            st.plan = Some((*plan).clone());
            st.agent_history.push(AgentRecord::new(
                Stage::Planner,
                StageStatus::Completed,
                started,
            ));
        }
        self.emit(analysis_id, Stage::Planner, StageStatus::Completed, None, None, None);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- Stage 2: evidence fan-out ----
        self.collect_evidence(&state, &request, &plan, &cancel).await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- Stage 3: timeline ----
        let started = Utc::now();
        {
            let mut st = state.lock().await;
            let timeline = self.correlator.build(&st.evidence, &plan);
            st.timeline = timeline;
            let events = st.timeline.events.len();
            st.agent_history.push(
                AgentRecord::new(Stage::Timeline, StageStatus::Completed, started)
                    .with_evidence_count(events),
            );
        }
        let event_count = state.lock().await.timeline.events.len();
        self.emit(
            analysis_id,
            Stage::Timeline,
            StageStatus::Completed,
            Some(event_count),
            None,
            None,
        );

        // ---- Stage 4: hypotheses (with optional enrichment) ----
        let started = Utc::now();
        let (mut hypotheses, notes) = {
            let st = state.lock().await;
            self.generator
                .generate(&st.timeline, &st.evidence, &cancel)
                .await
        };
        state.lock().await.errors.extend(notes);

        if self.generator.needs_enrichment(&hypotheses) && self.enrichment.is_some() {
            self.run_enrichment(
                &state,
                &plan,
                "Too few plausible root-cause hypotheses; gather evidence that suggests or rules out common failure modes.",
                &cancel,
            )
            .await;
            let st = state.lock().await;
            let (regenerated, notes) = self
                .generator
                .generate(&st.timeline, &st.evidence, &cancel)
                .await;
            drop(st);
            if !regenerated.is_empty() {
                hypotheses = regenerated;
            }
            state.lock().await.errors.extend(notes);
        }

        {
            let mut st = state.lock().await;
            st.hypotheses = hypotheses.clone();
            st.agent_history.push(
                AgentRecord::new(Stage::Hypothesis, StageStatus::Completed, started)
                    .with_evidence_count(hypotheses.len()),
            );
        }
        self.emit(
            analysis_id,
            Stage::Hypothesis,
            StageStatus::Completed,
            Some(hypotheses.len()),
            None,
            None,
        );

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- Stage 5: verification (with optional enrichment) ----
        let started = Utc::now();
        let (mut results, mut overall) = {
            let st = state.lock().await;
            self.verifier
                .verify_all(&st.hypotheses, &st.evidence, &st.timeline, &plan)
        };

        if overall < self.config.confidence_threshold
            && !results.is_empty()
            && self.enrichment.is_some()
        {
            let goal = {
                let st = state.lock().await;
                self.verifier.enrichment_goal(&st.hypotheses, &results)
            };
            self.run_enrichment(&state, &plan, &goal, &cancel).await;

            // Re-score the same hypotheses over the enlarged evidence
            // set; enrichment never adds hypotheses here.
            let st = state.lock().await;
            let reverified = self
                .verifier
                .verify_all(&st.hypotheses, &st.evidence, &st.timeline, &plan);
            results = reverified.0;
            overall = reverified.1;
        }

        {
            let mut st = state.lock().await;
            st.verifications = results.clone();
            st.overall_confidence = overall;
            st.agent_history.push(
                AgentRecord::new(Stage::Verifier, StageStatus::Completed, started)
                    .with_confidence(overall),
            );
        }
        self.emit(
            analysis_id,
            Stage::Verifier,
            StageStatus::Completed,
            None,
            Some(overall),
            None,
        );

        // ---- Stage 6: decision gate ----
        let started = Utc::now();
        let mut st = state.lock().await;
        let outcome = self.gate.decide(
            &st.hypotheses,
            &st.verifications,
            &st.timeline,
            &st.evidence,
            st.overall_confidence,
        );

        st.agent_history.push(
            AgentRecord::new(Stage::Decision, StageStatus::Completed, started)
                .with_confidence(outcome.confidence),
        );

        let mut bundle = EvidenceBundle::default();
        for ev in st.all_evidence() {
            bundle.push(ev);
        }
        let response = AnalysisResponse {
            analysis_id: st.analysis_id.to_string(),
            status: outcome.decision,
            confidence: outcome.confidence,
            root_cause: outcome.root_cause,
            evidence: Some(bundle),
            timeline: Some(TimelineEntry::project(&st.timeline)),
            recommended_actions: outcome.recommended_actions,
            alternative_hypotheses: outcome.alternative_hypotheses,
            missing_evidence: outcome.missing_evidence,
            processing_time_ms: elapsed_ms(&st),
            agent_history: st.agent_history.clone(),
            errors: (!st.errors.is_empty()).then(|| st.errors.clone()),
        };

        // Structural invariants hold before the response is released.
        st.validate(self.config.min_evidence_sources)?;
        st.response = Some(response.clone());
        drop(st);

        self.emit(
            analysis_id,
            Stage::Decision,
            StageStatus::Completed,
            None,
            Some(response.confidence),
            None,
        );
        let _ = self.events.send(ProgressEvent::Completed {
            analysis_id,
            response: Box::new(response),
        });

        info!(analysis_id = %analysis_id, "analysis run complete");
        Ok(())
    }

    /// Run the five evidence agents concurrently and apply their patches
    /// serially at the barrier, in agent-name order.
    async fn collect_evidence(
        &self,
        state: &Arc<Mutex<RunState>>,
        request: &Arc<AnalysisRequest>,
        plan: &Arc<Plan>,
        cancel: &CancellationToken,
    ) {
        let analysis_id = state.lock().await.analysis_id;
        let agent_timeout = Duration::from_secs(self.config.agent_timeout_secs);

        let mut join_set = JoinSet::new();
        for agent in &self.agents {
            if !plan.required_agents.contains(&agent.name()) {
                continue;
            }
            let agent = agent.clone();
            let ctx = AgentContext::new(request.clone(), plan.clone(), cancel.child_token());
            join_set.spawn(async move {
                let name = agent.name();
                let started = Utc::now();
                let outcome = tokio::time::timeout(agent_timeout, agent.collect(ctx)).await;
                (name, started, outcome)
            });
        }

        type AgentOutcome = (
            AgentName,
            chrono::DateTime<Utc>,
            std::result::Result<Result<verdict_core::state::EvidencePatch>, tokio::time::error::Elapsed>,
        );
        let mut outcomes: Vec<AgentOutcome> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    // A panicked agent is a hard failure with no name;
                    // record it against the run.
                    error!(error = %join_error, "evidence agent task failed");
                    state
                        .lock()
                        .await
                        .errors
                        .push(format!("evidence agent panicked: {}", join_error));
                    ::metrics::counter!("verdict_agent_failures_total").increment(1);
                }
            }
        }
        // Deterministic application order regardless of completion order.
        outcomes.sort_by_key(|(name, _, _)| *name);

        for (name, started, outcome) in outcomes {
            let stage = stage_for(name);
            match outcome {
                Ok(Ok(patch)) => {
                    let count = patch.evidence.len();
                    let first_error = patch.errors.first().cloned();
                    let mut st = state.lock().await;
                    st.apply_patch(patch);
                    let mut record = AgentRecord::new(stage, StageStatus::Completed, started)
                        .with_evidence_count(count);
                    if let Some(err) = &first_error {
                        record = record.with_error(err.clone());
                    }
                    st.agent_history.push(record);
                    drop(st);
                    self.emit(
                        analysis_id,
                        stage,
                        StageStatus::Completed,
                        Some(count),
                        None,
                        first_error,
                    );
                }
                Ok(Err(e)) => {
                    // Hard agent failure: same recovery as soft, plus a
                    // traceable record.
                    warn!(agent = %name, error = %e, "evidence agent failed");
                    ::metrics::counter!("verdict_agent_failures_total").increment(1);
                    let message = format!("{} agent failed: {}", name, e);
                    let mut st = state.lock().await;
                    st.errors.push(message.clone());
                    st.agent_history.push(
                        AgentRecord::new(stage, StageStatus::Failed, started)
                            .with_error(message.clone()),
                    );
                    drop(st);
                    self.emit(
                        analysis_id,
                        stage,
                        StageStatus::Failed,
                        Some(0),
                        None,
                        Some(message),
                    );
                }
                Err(_elapsed) => {
                    warn!(agent = %name, "evidence agent exceeded soft timeout");
                    ::metrics::counter!("verdict_agent_failures_total").increment(1);
                    let message = format!(
                        "{} agent timed out after {}s",
                        name, self.config.agent_timeout_secs
                    );
                    let mut st = state.lock().await;
                    st.errors.push(message.clone());
                    st.agent_history.push(
                        AgentRecord::new(stage, StageStatus::TimedOut, started)
                            .with_error(message.clone()),
                    );
                    drop(st);
                    self.emit(
                        analysis_id,
                        stage,
                        StageStatus::TimedOut,
                        Some(0),
                        None,
                        Some(message),
                    );
                }
            }
        }
    }

    /// One enrichment loop invocation; loops are serialized within a
    /// run by construction (the pipeline is sequential after fan-in).
    async fn run_enrichment(
        &self,
        state: &Arc<Mutex<RunState>>,
        plan: &Arc<Plan>,
        goal: &str,
        cancel: &CancellationToken,
    ) {
        let enrichment = match &self.enrichment {
            Some(enrichment) => enrichment.clone(),
            None => return,
        };
        let analysis_id = state.lock().await.analysis_id;
        let started = Utc::now();

        let prior_summary = {
            let st = state.lock().await;
            summarize_for_enrichment(&st)
        };

        let outcome = enrichment.run(goal, plan, &prior_summary, cancel).await;
        let evidence_count = outcome.evidence.len();
        let iterations = outcome.iterations;
        let first_error = outcome.errors.first().cloned();

        {
            let mut st = state.lock().await;
            st.apply_patch(verdict_core::state::EvidencePatch {
                evidence: outcome.evidence,
                errors: outcome.errors,
            });
            // Enrichment changed the evidence set; the timeline must
            // reference all of it.
            let timeline = self.correlator.build(&st.evidence, plan);
            st.timeline = timeline;
            st.agent_history.push(
                AgentRecord::new(Stage::ToolEnrichment, StageStatus::Completed, started)
                    .with_evidence_count(evidence_count)
                    .with_iterations(iterations),
            );
        }
        self.emit(
            analysis_id,
            Stage::ToolEnrichment,
            StageStatus::Completed,
            Some(evidence_count),
            None,
            first_error,
        );
    }

    fn emit(
        &self,
        analysis_id: uuid::Uuid,
        stage: Stage,
        status: StageStatus,
        evidence_count: Option<usize>,
        confidence: Option<f64>,
        error: Option<String>,
    ) {
        let _ = self.events.send(ProgressEvent::Stage(StageEvent {
            analysis_id,
            stage,
            status,
            evidence_count,
            confidence,
            error,
        }));
    }
}

fn stage_for(name: AgentName) -> Stage {
    match name {
        AgentName::Log => Stage::Log,
        AgentName::Rag => Stage::Rag,
        AgentName::Metrics => Stage::Metrics,
        AgentName::Dashboard => Stage::Dashboard,
        AgentName::Image => Stage::Image,
    }
}

fn elapsed_ms(state: &RunState) -> u64 {
    (Utc::now() - state.started_at).num_milliseconds().max(0) as u64
}

/// Compact context handed to the enrichment model.
fn summarize_for_enrichment(state: &RunState) -> String {
    let mut summary = String::new();
    if !state.timeline.events.is_empty() {
        summary.push_str("Timeline so far:\n");
        for event in state.timeline.events.iter().take(10) {
            summary.push_str(&format!(
                "  {} [{}] {}\n",
                event.time.format("%H:%M:%S"),
                event.source,
                event.event
            ));
        }
    }
    if !state.hypotheses.is_empty() {
        summary.push_str("Current hypotheses:\n");
        for h in &state.hypotheses {
            summary.push_str(&format!(
                "  {} (plausibility {:.2}): {}\n",
                h.id, h.plausibility, h.root_cause
            ));
        }
    }
    if summary.is_empty() {
        summary.push_str("No evidence collected yet.\n");
    }
    summary
}
