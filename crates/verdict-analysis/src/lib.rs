//! The analysis agents of the verdict pipeline.
//!
//! Evidence-producing agents (log, RAG, metrics, dashboard, image)
//! implement [`agents::EvidenceAgent`]: each consumes an immutable
//! snapshot of the plan and request and returns an additive patch. The
//! derived stages: timeline correlation, hypothesis generation, the
//! tool-calling enrichment loop, verification, and the decision gate -
//! are plain components invoked in sequence by the orchestrator.

pub mod agents;
pub mod decision;
pub mod enrichment;
pub mod hypothesis;
pub mod prompts;
pub mod timeline;
pub mod verifier;

pub use agents::{AgentContext, EvidenceAgent};
pub use decision::{DecisionGate, DecisionOutcome};
pub use enrichment::{BackendTools, EnrichmentLoop, EnrichmentOutcome, ObservabilityTools};
pub use hypothesis::HypothesisGenerator;
pub use timeline::TimelineCorrelator;
pub use verifier::Verifier;
