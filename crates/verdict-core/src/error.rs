//! Shared error taxonomy for the analysis pipeline.
//!
//! The taxonomy mirrors the propagation policy: input errors and state
//! invariant violations fail a run; everything else is recovered locally
//! by the responsible component and surfaced as metadata in the final
//! response.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed request, rejected before the pipeline starts.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An external backend (metrics, dashboards, vector index) failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The reasoning model was unreachable or returned unusable output.
    #[error("model error: {0}")]
    Model(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single agent exceeded its soft timeout.
    #[error("agent {agent} timed out after {seconds}s")]
    AgentTimeout { agent: String, seconds: u64 },

    /// The whole run exceeded the hard deadline.
    #[error("run deadline exceeded")]
    RunTimeout,

    /// The caller cancelled the run.
    #[error("run cancelled")]
    Cancelled,

    /// A state invariant was violated; this is an implementation bug.
    #[error("state invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a model error.
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create an invariant-violation error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Whether this error fails the run instead of being recorded as
    /// run metadata.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::Invariant(_) | Error::RunTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::invalid_request("empty query").is_fatal());
        assert!(Error::invariant("dangling reference").is_fatal());
        assert!(!Error::backend("connection refused").is_fatal());
        assert!(!Error::model("unparseable output").is_fatal());
    }
}
