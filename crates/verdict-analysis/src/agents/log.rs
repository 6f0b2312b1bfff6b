//! Log agent: ranked log evidence near the incident time.
//!
//! Two retrieval paths: vector similarity over an indexed log corpus
//! when an index is configured, and keyword/time scanning of the logs
//! attached to the request (inline entries plus base64 log files).
//! Both paths score into the same evidence shape.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use verdict_backends::{Corpus, VectorIndex};
use verdict_core::evidence::{Evidence, EvidencePayload};
use verdict_core::plan::AgentName;
use verdict_core::state::{EvidencePatch, LogEntry};
use verdict_core::{Config, Result};

use super::{AgentContext, EvidenceAgent};

/// Severity tokens and their score contribution.
const SEVERITY_SCORES: &[(&str, f64)] = &[
    ("FATAL", 1.0),
    ("CRITICAL", 1.0),
    ("ERROR", 0.9),
    ("WARN", 0.6),
    ("WARNING", 0.6),
    ("INFO", 0.3),
    ("DEBUG", 0.2),
];

pub struct LogAgent {
    config: Arc<Config>,
    vector: Option<Arc<dyn VectorIndex>>,
}

impl LogAgent {
    pub fn new(config: Arc<Config>, vector: Option<Arc<dyn VectorIndex>>) -> Self {
        Self { config, vector }
    }

    /// Scan request-attached logs: window and service filters, then
    /// severity/keyword/proximity scoring.
    fn keyword_path(&self, ctx: &AgentContext, entries: &[LogEntry]) -> Vec<Evidence> {
        let plan = &ctx.plan;
        let window = plan.window_for(AgentName::Log);
        let keywords: Vec<&str> = plan
            .symptoms
            .iter()
            .flat_map(|s| s.keywords().iter().copied())
            .collect();

        let mut evidence = Vec::new();
        for entry in entries {
            if let Some(ts) = entry.timestamp {
                if !window.contains(plan.incident_time, ts) {
                    continue;
                }
            }
            if !plan.affected_services.is_empty() {
                if let Some(service) = &entry.service {
                    if !plan
                        .affected_services
                        .iter()
                        .any(|s| service.eq_ignore_ascii_case(s))
                    {
                        continue;
                    }
                }
            }

            let message_lower = entry.message.to_lowercase();
            let matched: Vec<String> = keywords
                .iter()
                .filter(|kw| message_lower.contains(*kw))
                .map(|kw| kw.to_string())
                .collect();

            let severity = severity_score(entry.level.as_deref(), &entry.message);
            let keyword_score = (matched.len() as f64 * 0.05).min(0.2);
            let proximity = proximity_factor(
                entry.timestamp,
                plan.incident_time,
                window.before_minutes.max(window.after_minutes) * 60,
            );
            let confidence = 0.5 * severity + keyword_score + 0.3 * proximity;

            evidence.push(Evidence::new(
                entry.message.clone(),
                entry.timestamp,
                confidence,
                EvidencePayload::Log {
                    service: entry.service.clone(),
                    level: entry.level.clone(),
                    matched_terms: matched,
                    similarity: None,
                },
            ));
        }
        evidence
    }

    /// Vector similarity over the indexed log corpus, recency-boosted
    /// toward the incident time.
    async fn vector_path(&self, ctx: &AgentContext, errors: &mut Vec<String>) -> Vec<Evidence> {
        let index = match &self.vector {
            Some(index) => index,
            None => return Vec::new(),
        };
        let plan = &ctx.plan;
        let query = if plan.symptoms.is_empty() {
            "error exception failure".to_string()
        } else {
            plan.symptoms
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };

        let embedding = match index.embed(&query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                errors.push(format!("log vector search unavailable: {}", e));
                return Vec::new();
            }
        };

        let hits = match index
            .search(
                Corpus::Logs,
                &embedding,
                self.config.log_top_k,
                &Default::default(),
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                errors.push(format!("log vector search failed: {}", e));
                return Vec::new();
            }
        };

        let window = plan.window_for(AgentName::Log);
        hits.into_iter()
            .map(|hit| {
                let content = hit
                    .payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or(hit.id.as_str())
                    .to_string();
                let timestamp = hit
                    .payload
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok());
                let service = hit
                    .payload
                    .get("service")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let level = hit
                    .payload
                    .get("level")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let proximity = proximity_factor(
                    timestamp,
                    plan.incident_time,
                    window.before_minutes.max(window.after_minutes) * 60,
                );
                let confidence = 0.6 * hit.similarity + 0.4 * proximity;

                Evidence::new(
                    content,
                    timestamp,
                    confidence,
                    EvidencePayload::Log {
                        service,
                        level,
                        matched_terms: Vec::new(),
                        similarity: Some(hit.similarity),
                    },
                )
            })
            .collect()
    }
}

#[async_trait]
impl EvidenceAgent for LogAgent {
    fn name(&self) -> AgentName {
        AgentName::Log
    }

    async fn collect(&self, ctx: AgentContext) -> Result<EvidencePatch> {
        let mut errors = Vec::new();

        let mut entries = ctx.request.logs.clone();
        for file in &ctx.request.log_files {
            match decode_log_file(&file.content_base64) {
                Ok(lines) => {
                    debug!(file = %file.filename, lines = lines.len(), "decoded log attachment");
                    entries.extend(lines);
                }
                Err(e) => {
                    warn!(file = %file.filename, error = %e, "skipping undecodable log attachment");
                    errors.push(format!("log file {} not decodable: {}", file.filename, e));
                }
            }
        }

        let mut evidence = self.vector_path(&ctx, &mut errors).await;
        evidence.extend(self.keyword_path(&ctx, &entries));

        evidence = collapse_bursts(evidence);
        evidence.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        evidence.truncate(self.config.log_top_k);

        Ok(EvidencePatch { evidence, errors })
    }
}

fn severity_score(level: Option<&str>, message: &str) -> f64 {
    if let Some(level) = level {
        let level = level.to_uppercase();
        for (token, score) in SEVERITY_SCORES {
            if level == *token {
                return *score;
            }
        }
    }
    let upper = message.to_uppercase();
    for (token, score) in SEVERITY_SCORES {
        if upper.contains(token) {
            return *score;
        }
    }
    0.4
}

/// Linear decay toward the window edge; neutral when no timestamp.
fn proximity_factor(
    timestamp: Option<DateTime<Utc>>,
    incident_time: DateTime<Utc>,
    window_secs: i64,
) -> f64 {
    match timestamp {
        Some(ts) => {
            let delta = (ts - incident_time).num_seconds().abs();
            (1.0 - delta as f64 / window_secs.max(1) as f64).clamp(0.0, 1.0)
        }
        None => 0.5,
    }
}

/// Decode a base64 log attachment into best-effort parsed entries.
fn decode_log_file(content_base64: &str) -> std::result::Result<Vec<LogEntry>, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(content_base64.trim())
        .map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&bytes);

    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_log_line)
        .collect())
}

/// Parse `<timestamp> <LEVEL> [service] message` shapes, degrading to a
/// bare message.
fn parse_log_line(line: &str) -> LogEntry {
    let mut remainder = line.trim();
    let mut timestamp = None;

    if let Some((first, rest)) = remainder.split_once(' ') {
        if let Ok(ts) = first.parse::<DateTime<Utc>>() {
            timestamp = Some(ts);
            remainder = rest.trim_start();
        } else if let Some((second, rest2)) = rest.split_once(' ') {
            let combined = format!("{} {}", first, second);
            if let Ok(naive) = NaiveDateTime::parse_from_str(&combined, "%Y-%m-%d %H:%M:%S") {
                timestamp = Some(naive.and_utc());
                remainder = rest2.trim_start();
            }
        }
    }

    let mut level = None;
    if let Some((first, rest)) = remainder.split_once(' ') {
        let candidate = first.trim_matches(|c| c == '[' || c == ']' || c == ':');
        if SEVERITY_SCORES
            .iter()
            .any(|(token, _)| candidate.eq_ignore_ascii_case(token))
        {
            level = Some(candidate.to_uppercase());
            remainder = rest.trim_start();
        }
    }

    let mut service = None;
    if let Some((first, rest)) = remainder.split_once(' ') {
        // Only a trailing colon marks a service prefix; anything else is
        // message text.
        if let Some(candidate) = first.strip_suffix(':') {
            if !candidate.is_empty()
                && candidate.chars().all(|c| c.is_alphanumeric() || c == '-')
            {
                service = Some(candidate.to_string());
                remainder = rest.trim_start();
            }
        }
    }

    LogEntry {
        timestamp,
        level,
        service,
        message: remainder.to_string(),
    }
}

/// Collapse repeated near-identical lines into one annotated item.
fn collapse_bursts(evidence: Vec<Evidence>) -> Vec<Evidence> {
    let mut out: Vec<Evidence> = Vec::new();
    let mut counts: Vec<(String, usize)> = Vec::new();

    for ev in evidence {
        let core = normalize_message(&ev.content);
        match counts.iter_mut().find(|(key, _)| *key == core) {
            Some((_, count)) => *count += 1,
            None => {
                counts.push((core, 1));
                out.push(ev);
            }
        }
    }

    for ev in &mut out {
        let core = normalize_message(&ev.content);
        if let Some((_, count)) = counts.iter().find(|(key, _)| *key == core) {
            if *count >= 3 {
                ev.content = format!("{} (repeated {} times in window)", ev.content, count);
                ev.confidence = (ev.confidence + 0.05).min(1.0);
            }
        }
    }
    out
}

/// Strip digits so "worker 17 died" and "worker 23 died" collapse.
fn normalize_message(message: &str) -> String {
    message
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>()
        .to_lowercase()
}
