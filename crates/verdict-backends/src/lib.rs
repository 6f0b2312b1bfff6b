//! Adapters for the external backends the pipeline consumes.
//!
//! Each backend is reached through a narrow, typed client: a
//! Prometheus-compatible metrics API, a Grafana-compatible dashboard
//! API, a messages-style reasoning-model API, and a vector index.
//! Clients own a pooled `reqwest::Client` and are safe for concurrent
//! use; all failures surface as typed errors the agents convert into
//! recorded, non-fatal run errors.

pub mod grafana;
pub mod llm;
pub mod prometheus;
pub mod vector;

pub use grafana::{Annotation, DashboardDetail, DashboardHit, GrafanaClient, GrafanaError};
pub use llm::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, LlmClient, LlmError, Role, StopReason,
    ToolDefinition,
};
pub use prometheus::{
    FiringAlert, InstantSample, PrometheusClient, PrometheusError, RangeSeries, ScrapeTarget,
};
pub use vector::{Corpus, InMemoryIndex, RemoteVectorIndex, SearchHit, VectorError, VectorIndex};
