//! The planner's output: which agents run, where they look, and when.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evidence::SourceKind;

/// Names of the evidence-producing agents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Log,
    Rag,
    Metrics,
    Dashboard,
    Image,
}

impl AgentName {
    pub const ALL: [AgentName; 5] = [
        AgentName::Log,
        AgentName::Rag,
        AgentName::Metrics,
        AgentName::Dashboard,
        AgentName::Image,
    ];

    /// Parse an agent name from its wire tag.
    pub fn from_tag(tag: &str) -> Option<AgentName> {
        AgentName::ALL
            .into_iter()
            .find(|a| a.as_str() == tag.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Log => "log",
            AgentName::Rag => "rag",
            AgentName::Metrics => "metrics",
            AgentName::Dashboard => "dashboard",
            AgentName::Image => "image",
        }
    }

    /// The evidence kind this agent produces.
    pub fn source_kind(&self) -> SourceKind {
        match self {
            AgentName::Log => SourceKind::Log,
            AgentName::Rag => SourceKind::Rag,
            AgentName::Metrics => SourceKind::Metrics,
            AgentName::Dashboard => SourceKind::Dashboard,
            AgentName::Image => SourceKind::Image,
        }
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized symptom tags recognized by the pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Symptom {
    Latency,
    ErrorRate,
    Crash,
    Memory,
    Cpu,
    Network,
    Deployment,
    Dependency,
}

impl Symptom {
    pub const ALL: [Symptom; 8] = [
        Symptom::Latency,
        Symptom::ErrorRate,
        Symptom::Crash,
        Symptom::Memory,
        Symptom::Cpu,
        Symptom::Network,
        Symptom::Deployment,
        Symptom::Dependency,
    ];

    /// Parse a normalized tag back into a symptom.
    pub fn from_tag(tag: &str) -> Option<Symptom> {
        Symptom::ALL
            .into_iter()
            .find(|s| s.as_str() == tag.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Symptom::Latency => "latency",
            Symptom::ErrorRate => "error_rate",
            Symptom::Crash => "crash",
            Symptom::Memory => "memory",
            Symptom::Cpu => "cpu",
            Symptom::Network => "network",
            Symptom::Deployment => "deployment",
            Symptom::Dependency => "dependency",
        }
    }

    /// Keywords that map free text onto this symptom.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Symptom::Latency => &["latency", "slow", "response time", "timeout", "degraded"],
            Symptom::ErrorRate => &["error", "500", "503", "5xx", "4xx", "failure", "failing"],
            Symptom::Crash => &["crash", "panic", "oom", "killed", "restart", "down", "outage"],
            Symptom::Memory => &["memory", "leak", "heap", "oom"],
            Symptom::Cpu => &["cpu", "load", "utilization", "throttl"],
            Symptom::Network => &["network", "connection", "dns", "socket", "refused"],
            Symptom::Deployment => &["deploy", "deployment", "release", "rollout", "rollback"],
            Symptom::Dependency => &["dependency", "upstream", "downstream", "third-party"],
        }
    }
}

impl std::fmt::Display for Symptom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident priority, derived from symptoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A search window around the incident time, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub before_minutes: i64,
    pub after_minutes: i64,
}

impl SearchWindow {
    pub fn symmetric(minutes: i64) -> Self {
        Self {
            before_minutes: minutes,
            after_minutes: minutes,
        }
    }

    /// Default window for an agent: ±30 min for logs/metrics/dashboards,
    /// ±35 min for the metrics backend's scrape slack, 7 days back for RAG.
    pub fn default_for(agent: AgentName) -> Self {
        match agent {
            AgentName::Log | AgentName::Dashboard | AgentName::Image => Self::symmetric(30),
            AgentName::Metrics => Self::symmetric(35),
            AgentName::Rag => Self {
                before_minutes: 7 * 24 * 60,
                after_minutes: 30,
            },
        }
    }

    pub fn start(&self, incident_time: DateTime<Utc>) -> DateTime<Utc> {
        incident_time - Duration::minutes(self.before_minutes)
    }

    pub fn end(&self, incident_time: DateTime<Utc>) -> DateTime<Utc> {
        incident_time + Duration::minutes(self.after_minutes)
    }

    pub fn contains(&self, incident_time: DateTime<Utc>, t: DateTime<Utc>) -> bool {
        t >= self.start(incident_time) && t <= self.end(incident_time)
    }
}

/// The execution plan derived from the incident request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Incident time, normalized to UTC.
    pub incident_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symptoms: Vec<Symptom>,
    /// One window per required agent.
    pub search_windows: BTreeMap<AgentName, SearchWindow>,
    pub required_agents: Vec<AgentName>,
    pub priority: Priority,
}

impl Plan {
    /// Window for an agent, falling back to its default.
    pub fn window_for(&self, agent: AgentName) -> SearchWindow {
        self.search_windows
            .get(&agent)
            .copied()
            .unwrap_or_else(|| SearchWindow::default_for(agent))
    }

    /// The widest non-RAG window; used as the plan window for timeline
    /// gap detection.
    pub fn observation_window(&self) -> SearchWindow {
        self.search_windows
            .iter()
            .filter(|(agent, _)| **agent != AgentName::Rag)
            .map(|(_, w)| *w)
            .max_by_key(|w| w.before_minutes + w.after_minutes)
            .unwrap_or_else(|| SearchWindow::symmetric(30))
    }

    /// Every required agent must have a search window.
    pub fn validate(&self) -> Result<()> {
        for agent in &self.required_agents {
            if !self.search_windows.contains_key(agent) {
                return Err(Error::invariant(format!(
                    "required agent {} has no search window",
                    agent
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn incident() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 0).unwrap()
    }

    #[test]
    fn default_windows_per_agent() {
        let logs = SearchWindow::default_for(AgentName::Log);
        assert_eq!(logs.before_minutes, 30);

        let rag = SearchWindow::default_for(AgentName::Rag);
        assert!(rag.before_minutes > logs.before_minutes);
    }

    #[test]
    fn window_bounds() {
        let window = SearchWindow::symmetric(30);
        let start = window.start(incident());
        let end = window.end(incident());
        assert_eq!((end - start).num_minutes(), 60);
        assert!(window.contains(incident(), incident()));
        assert!(!window.contains(incident(), end + Duration::minutes(1)));
    }

    #[test]
    fn plan_requires_windows_for_required_agents() {
        let plan = Plan {
            incident_time: incident(),
            affected_services: vec!["api-gateway".to_string()],
            symptoms: vec![Symptom::ErrorRate],
            search_windows: BTreeMap::new(),
            required_agents: vec![AgentName::Log],
            priority: Priority::High,
        };
        assert!(plan.validate().is_err());
    }
}
