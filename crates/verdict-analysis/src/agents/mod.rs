//! Evidence agent contract.
//!
//! An agent is a pure function from an immutable snapshot to an
//! additive patch: it may suspend on external I/O, it may fail softly,
//! but it never mutates shared state and never observes another agent's
//! output. The orchestrator applies patches serially at stage
//! boundaries.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use verdict_core::plan::{AgentName, Plan};
use verdict_core::state::{AnalysisRequest, EvidencePatch};
use verdict_core::Result;

pub mod dashboard;
pub mod image;
pub mod log;
pub mod metrics;
pub mod planner;
pub mod rag;

pub use dashboard::DashboardAgent;
pub use image::ImageAgent;
pub use log::LogAgent;
pub use metrics::MetricsAgent;
pub use planner::Planner;
pub use rag::RagAgent;

/// Immutable snapshot handed to every evidence agent. Cloning is cheap;
/// the request and plan are shared.
#[derive(Clone)]
pub struct AgentContext {
    pub request: Arc<AnalysisRequest>,
    pub plan: Arc<Plan>,
    /// Cancellation propagates into every backend call.
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(request: Arc<AnalysisRequest>, plan: Arc<Plan>, cancel: CancellationToken) -> Self {
        Self {
            request,
            plan,
            cancel,
        }
    }
}

/// An evidence-producing agent.
#[async_trait]
pub trait EvidenceAgent: Send + Sync {
    fn name(&self) -> AgentName;

    /// Collect evidence for the plan. Soft failures belong in the
    /// patch's error list; an `Err` is treated as a hard agent failure
    /// by the orchestrator (same recovery, plus a traceable record).
    async fn collect(&self, ctx: AgentContext) -> Result<EvidencePatch>;
}
