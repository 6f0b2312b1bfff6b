//! Runtime configuration.
//!
//! Values are resolved in precedence order: JSON overrides file (when
//! given), then environment variables, then built-in defaults. All
//! thresholds are range-checked by [`Config::validate`]; the pipeline
//! refuses to start with an out-of-range configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // === Decision thresholds ===
    /// Minimum overall confidence to answer.
    pub confidence_threshold: f64,
    /// Minimum distinct source kinds for a SUPPORTED verdict.
    pub min_evidence_sources: usize,
    /// Maximum hypotheses emitted by the generator.
    pub max_hypotheses: usize,

    // === Enrichment loop ===
    /// Iteration budget for the tool-calling loop.
    pub max_tool_iterations: usize,
    /// Wall-clock budget for one enrichment loop (seconds).
    pub tool_loop_budget_secs: u64,

    // === Scheduling ===
    /// Per-agent soft timeout (seconds).
    pub agent_timeout_secs: u64,
    /// Per-run hard deadline (seconds).
    pub run_timeout_secs: u64,

    // === Backends ===
    /// Prometheus-compatible metrics backend base URL.
    pub metrics_url: String,
    /// Grafana-compatible dashboard backend base URL.
    pub dashboard_url: String,
    /// Bearer token for the dashboard backend.
    pub dashboard_api_key: Option<String>,
    /// Reasoning-model API base URL.
    pub llm_api_url: Option<String>,
    /// Reasoning-model API key.
    pub llm_api_key: Option<String>,
    /// Primary reasoning model identifier.
    pub llm_primary_model: String,
    /// Vision-capable model identifier for screenshot analysis.
    pub vision_model: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Vector index service base URL; absent means no similarity search.
    pub vector_index_url: Option<String>,

    // === Retrieval caps ===
    /// Maximum log evidence items returned.
    pub log_top_k: usize,
    /// Maximum items per RAG sub-search.
    pub rag_top_k: usize,
    /// Similarity floor for historical incidents.
    pub incident_min_similarity: f64,
    /// Similarity floor for runbook sections.
    pub runbook_min_similarity: f64,

    // === Timeline ===
    /// Window for correlating events across sources (seconds).
    pub correlation_window_secs: i64,
    /// Minimum silent interval reported as a gap (seconds).
    pub gap_threshold_secs: i64,

    // === Logging ===
    /// Log level directive.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_evidence_sources: 2,
            max_hypotheses: 5,
            max_tool_iterations: 10,
            tool_loop_budget_secs: 60,
            agent_timeout_secs: 30,
            run_timeout_secs: 120,
            metrics_url: "http://localhost:9090".to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
            dashboard_api_key: None,
            llm_api_url: None,
            llm_api_key: None,
            llm_primary_model: "claude-sonnet-4-20250514".to_string(),
            vision_model: "claude-sonnet-4-20250514".to_string(),
            embedding_model: "all-minilm-l6-v2".to_string(),
            vector_index_url: None,
            log_top_k: 20,
            rag_top_k: 5,
            incident_min_similarity: 0.5,
            runbook_min_similarity: 0.4,
            correlation_window_secs: 120,
            gap_threshold_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Build a configuration from environment variables over defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a JSON overrides file layered over the
    /// environment and defaults. Missing file keys fall through.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();

        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let overrides: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)?;
        config.apply_overrides(&overrides)?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        env_f64("CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_usize("MIN_EVIDENCE_SOURCES", &mut self.min_evidence_sources);
        env_usize("MAX_HYPOTHESES", &mut self.max_hypotheses);
        env_usize("MAX_TOOL_ITERATIONS", &mut self.max_tool_iterations);
        env_u64("TOOL_LOOP_BUDGET_SECONDS", &mut self.tool_loop_budget_secs);
        env_u64("AGENT_TIMEOUT_SECONDS", &mut self.agent_timeout_secs);
        env_u64("RUN_TIMEOUT_SECONDS", &mut self.run_timeout_secs);
        env_string("METRICS_URL", &mut self.metrics_url);
        env_string("DASHBOARD_URL", &mut self.dashboard_url);
        env_opt_string("DASHBOARD_API_KEY", &mut self.dashboard_api_key);
        env_opt_string("LLM_API_URL", &mut self.llm_api_url);
        env_opt_string("LLM_API_KEY", &mut self.llm_api_key);
        env_string("LLM_PRIMARY_MODEL", &mut self.llm_primary_model);
        env_string("VISION_MODEL", &mut self.vision_model);
        env_string("EMBEDDING_MODEL", &mut self.embedding_model);
        env_opt_string("VECTOR_INDEX_URL", &mut self.vector_index_url);
        // Back-compat name for deployments that mount the index locally.
        env_opt_string("VECTOR_INDEX_PATH", &mut self.vector_index_url);
        env_usize("LOG_TOP_K", &mut self.log_top_k);
        env_usize("RAG_TOP_K", &mut self.rag_top_k);
        env_string("LOG_LEVEL", &mut self.log_level);
    }

    fn apply_overrides(&mut self, overrides: &HashMap<String, serde_json::Value>) -> Result<()> {
        // Round-trip through JSON so override keys map onto field names
        // without a second schema.
        let mut value = serde_json::to_value(&*self)?;
        if let serde_json::Value::Object(map) = &mut value {
            for (key, val) in overrides {
                let key = key.to_ascii_lowercase();
                if map.contains_key(&key) {
                    map.insert(key, val.clone());
                }
            }
        }
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    /// Validate threshold ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::config(format!(
                "confidence_threshold must be between 0.0 and 1.0, got {}",
                self.confidence_threshold
            )));
        }
        if self.min_evidence_sources == 0 {
            return Err(Error::config("min_evidence_sources must be at least 1"));
        }
        if self.max_hypotheses < 2 {
            return Err(Error::config("max_hypotheses must be at least 2"));
        }
        if self.max_tool_iterations == 0 {
            return Err(Error::config("max_tool_iterations must be at least 1"));
        }
        if self.agent_timeout_secs == 0 || self.run_timeout_secs == 0 {
            return Err(Error::config("timeouts must be greater than 0"));
        }
        if self.agent_timeout_secs > self.run_timeout_secs {
            return Err(Error::config(
                "agent_timeout_secs cannot exceed run_timeout_secs",
            ));
        }
        for (name, floor) in [
            ("incident_min_similarity", self.incident_min_similarity),
            ("runbook_min_similarity", self.runbook_min_similarity),
        ] {
            if !(0.0..=1.0).contains(&floor) {
                return Err(Error::config(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, floor
                )));
            }
        }
        if self.correlation_window_secs <= 0 || self.gap_threshold_secs <= 0 {
            return Err(Error::config("timeline windows must be positive"));
        }
        Ok(())
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn env_opt_string(key: &str, target: &mut Option<String>) {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            *target = Some(value);
        }
    }
}

fn env_f64(key: &str, target: &mut f64) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_usize(key: &str, target: &mut usize) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_agent_timeout_above_run_timeout() {
        let mut config = Config::default();
        config.agent_timeout_secs = 300;
        config.run_timeout_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_layer_over_defaults() {
        let mut config = Config::default();
        let mut overrides = HashMap::new();
        overrides.insert(
            "CONFIDENCE_THRESHOLD".to_string(),
            serde_json::json!(0.55),
        );
        overrides.insert("unknown_key".to_string(), serde_json::json!("ignored"));
        config.apply_overrides(&overrides).unwrap();
        assert!((config.confidence_threshold - 0.55).abs() < f64::EPSILON);
        assert_eq!(config.min_evidence_sources, 2);
    }
}
