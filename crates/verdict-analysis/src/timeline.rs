//! Timeline correlator: merge evidence onto one ordered axis, find
//! cross-source correlations and coverage gaps.
//!
//! Correlations are detected by sliding a small window over the sorted
//! events and collecting co-occurrences, filtered to patterns that
//! involve at least two distinct source kinds. Gaps are silent
//! intervals of at least `gap_threshold` inside the plan window, plus
//! expected sources that produced nothing at all.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use verdict_core::evidence::{DashboardItemKind, Evidence, EvidencePayload, SourceKind};
use verdict_core::plan::Plan;
use verdict_core::timeline::{
    Correlation, CorrelationStrength, Timeline, TimelineEvent, TimelineGap,
};
use verdict_core::Config;

/// Events examined ahead of each event when correlating.
const LOOKAHEAD: usize = 4;
/// Longest event label kept on the timeline.
const MAX_LABEL_LEN: usize = 120;

/// Coarse event classes used by the correlation pattern table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    Deployment,
    MetricAnomaly,
    Error,
    Performance,
    Capacity,
    Configuration,
    Other,
}

/// Known causal patterns, ordered (earlier class, later class).
const PATTERNS: &[(EventClass, EventClass, &str)] = &[
    (
        EventClass::Deployment,
        EventClass::Error,
        "deployment preceded errors",
    ),
    (
        EventClass::Deployment,
        EventClass::MetricAnomaly,
        "deployment preceded metric anomaly",
    ),
    (
        EventClass::MetricAnomaly,
        EventClass::Error,
        "metric anomaly preceded errors",
    ),
    (
        EventClass::Capacity,
        EventClass::Performance,
        "capacity pressure preceded performance degradation",
    ),
    (EventClass::Error, EventClass::Error, "cascading errors"),
    (
        EventClass::Configuration,
        EventClass::Error,
        "configuration change preceded errors",
    ),
];

pub struct TimelineCorrelator {
    correlation_window_secs: i64,
    gap_threshold_secs: i64,
}

impl TimelineCorrelator {
    pub fn new(config: &Config) -> Self {
        Self {
            correlation_window_secs: config.correlation_window_secs,
            gap_threshold_secs: config.gap_threshold_secs,
        }
    }

    /// Build the correlated timeline from all collected evidence.
    pub fn build(&self, evidence: &BTreeMap<SourceKind, Vec<Evidence>>, plan: &Plan) -> Timeline {
        let mut events = self.project(evidence, plan);
        // Stable sort keeps same-time events in source order.
        events.sort_by_key(|e| e.time);

        let classes: Vec<EventClass> = events
            .iter()
            .map(|event| {
                evidence
                    .get(&event.source)
                    .and_then(|items| items.iter().find(|ev| ev.id == event.evidence_id))
                    .map(classify)
                    .unwrap_or(EventClass::Other)
            })
            .collect();

        let correlations = self.correlate(&events, &classes);
        let gaps = self.find_gaps(&events, evidence, plan);

        debug!(
            events = events.len(),
            correlations = correlations.len(),
            gaps = gaps.len(),
            "timeline built"
        );
        Timeline {
            events,
            correlations,
            gaps,
        }
    }

    /// Evidence → TimelineEvent projection. Items without a timestamp
    /// adopt the time of the nearest timestamped item from the same
    /// source; sources with no timestamps at all stay off the timeline.
    fn project(
        &self,
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        plan: &Plan,
    ) -> Vec<TimelineEvent> {
        let window = plan.observation_window();
        let (start, end) = (
            window.start(plan.incident_time),
            window.end(plan.incident_time),
        );

        let mut events = Vec::new();
        for items in evidence.values() {
            let timed: Vec<DateTime<Utc>> =
                items.iter().filter_map(|ev| ev.timestamp).collect();

            for ev in items {
                let time = match ev.timestamp {
                    Some(t) => t,
                    // Nearest same-source neighbor, falling back to drop.
                    None => match nearest(&timed, plan.incident_time) {
                        Some(t) if t >= start && t <= end => t,
                        _ => continue,
                    },
                };
                events.push(TimelineEvent {
                    time,
                    event: event_label(ev),
                    source: ev.source(),
                    confidence: ev.confidence,
                    evidence_id: ev.id,
                });
            }
        }
        events
    }

    fn correlate(&self, events: &[TimelineEvent], classes: &[EventClass]) -> Vec<Correlation> {
        let mut correlations = Vec::new();
        let mut seen: Vec<(uuid::Uuid, uuid::Uuid)> = Vec::new();

        for i in 0..events.len() {
            for j in (i + 1)..events.len().min(i + 1 + LOOKAHEAD) {
                let span = (events[j].time - events[i].time).num_seconds();
                if span > self.correlation_window_secs {
                    break;
                }
                // Correlations require two distinct source kinds.
                if events[i].source == events[j].source {
                    continue;
                }
                let key = (events[i].evidence_id, events[j].evidence_id);
                if seen.contains(&key) {
                    continue;
                }

                let known = PATTERNS
                    .iter()
                    .find(|(a, b, _)| *a == classes[i] && *b == classes[j]);
                let pattern = match known {
                    Some((_, _, label)) => (*label).to_string(),
                    None => format!(
                        "{} activity followed by {} activity",
                        events[i].source, events[j].source
                    ),
                };
                let strength = strength_for(span, known.is_some());

                seen.push(key);
                correlations.push(Correlation {
                    pattern,
                    evidence_ids: vec![events[i].evidence_id, events[j].evidence_id],
                    sources: vec![events[i].source, events[j].source],
                    span_secs: span,
                    strength,
                });
            }
        }
        correlations
    }

    fn find_gaps(
        &self,
        events: &[TimelineEvent],
        evidence: &BTreeMap<SourceKind, Vec<Evidence>>,
        plan: &Plan,
    ) -> Vec<TimelineGap> {
        let window = plan.observation_window();
        let start = window.start(plan.incident_time);
        let end = window.end(plan.incident_time);

        let mut gaps = Vec::new();

        // Silent intervals between consecutive in-window events,
        // including the window edges.
        let mut cursor = start;
        let mut any_in_window = false;
        for event in events.iter().filter(|e| e.time >= start && e.time <= end) {
            any_in_window = true;
            if (event.time - cursor).num_seconds() >= self.gap_threshold_secs {
                gaps.push(TimelineGap {
                    start: cursor,
                    end: event.time,
                    missing: None,
                });
            }
            cursor = cursor.max(event.time);
        }
        if !any_in_window {
            gaps.push(TimelineGap {
                start,
                end,
                missing: None,
            });
        } else if (end - cursor).num_seconds() >= self.gap_threshold_secs {
            gaps.push(TimelineGap {
                start: cursor,
                end,
                missing: None,
            });
        }

        // Expected sources that produced nothing.
        for agent in &plan.required_agents {
            let kind = agent.source_kind();
            let produced = evidence.get(&kind).map(|v| !v.is_empty()).unwrap_or(false);
            if !produced {
                gaps.push(TimelineGap {
                    start,
                    end,
                    missing: Some(kind),
                });
            }
        }

        gaps
    }
}

fn nearest(timed: &[DateTime<Utc>], anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    timed
        .iter()
        .min_by_key(|t| (**t - anchor).num_seconds().abs())
        .copied()
}

fn strength_for(span_secs: i64, known_pattern: bool) -> CorrelationStrength {
    if span_secs < 60 || (known_pattern && span_secs < 300) {
        CorrelationStrength::Strong
    } else if span_secs < 180 {
        CorrelationStrength::Medium
    } else {
        CorrelationStrength::Weak
    }
}

/// Short label for the timeline; error lines keep their message tail.
fn event_label(ev: &Evidence) -> String {
    let mut label = ev.content.clone();
    if ev.source() == SourceKind::Log {
        for marker in ["CRITICAL:", "ERROR:"] {
            if let Some((_, tail)) = label.split_once(marker) {
                label = format!("{} {}", marker.trim_end_matches(':'), tail.trim());
                break;
            }
        }
    }
    if label.len() > MAX_LABEL_LEN {
        let mut cut = MAX_LABEL_LEN;
        while !label.is_char_boundary(cut) {
            cut -= 1;
        }
        label.truncate(cut);
        label.push_str("...");
    }
    label
}

fn classify(ev: &Evidence) -> EventClass {
    // Payload carries the strongest signal.
    match &ev.payload {
        EvidencePayload::Dashboard { kind, tags, .. } => {
            if *kind == DashboardItemKind::Annotation
                && tags.iter().any(|t| t.contains("deploy"))
            {
                return EventClass::Deployment;
            }
        }
        EvidencePayload::Metrics { anomalies, .. } => {
            if !anomalies.is_empty() {
                return EventClass::MetricAnomaly;
            }
        }
        _ => {}
    }

    let content = ev.content.to_lowercase();
    if ["deploy", "release", "rollout"]
        .iter()
        .any(|kw| content.contains(kw))
    {
        EventClass::Deployment
    } else if ["spike", "surge", "flatline", "drop", "anomaly"]
        .iter()
        .any(|kw| content.contains(kw))
    {
        EventClass::MetricAnomaly
    } else if ["error", "exception", "failure", "crash", "5xx", "500"]
        .iter()
        .any(|kw| content.contains(kw))
    {
        EventClass::Error
    } else if ["slow", "timeout", "latency"]
        .iter()
        .any(|kw| content.contains(kw))
    {
        EventClass::Performance
    } else if ["memory", "cpu", "disk", "connection pool", "saturat"]
        .iter()
        .any(|kw| content.contains(kw))
    {
        EventClass::Capacity
    } else if ["config", "setting", "feature flag"]
        .iter()
        .any(|kw| content.contains(kw))
    {
        EventClass::Configuration
    } else {
        EventClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use verdict_core::evidence::{MetricAnomaly, MetricStats};
    use verdict_core::plan::{AgentName, Priority, SearchWindow};

    fn incident() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 0).unwrap()
    }

    fn plan() -> Plan {
        let mut windows = BTreeMap::new();
        windows.insert(AgentName::Log, SearchWindow::symmetric(30));
        windows.insert(AgentName::Metrics, SearchWindow::symmetric(30));
        windows.insert(AgentName::Dashboard, SearchWindow::symmetric(30));
        Plan {
            incident_time: incident(),
            affected_services: vec!["api-gateway".to_string()],
            symptoms: vec![],
            search_windows: windows,
            required_agents: vec![AgentName::Log, AgentName::Metrics, AgentName::Dashboard],
            priority: Priority::High,
        }
    }

    fn log_ev(offset_secs: i64, content: &str) -> Evidence {
        Evidence::new(
            content,
            Some(incident() + Duration::seconds(offset_secs)),
            0.9,
            EvidencePayload::Log {
                service: Some("api-gateway".to_string()),
                level: Some("ERROR".to_string()),
                matched_terms: vec![],
                similarity: None,
            },
        )
    }

    fn deploy_annotation(offset_secs: i64) -> Evidence {
        Evidence::new(
            "deployment v2.1.5",
            Some(incident() + Duration::seconds(offset_secs)),
            0.85,
            EvidencePayload::Dashboard {
                uid: None,
                title: "deployment v2.1.5".to_string(),
                kind: DashboardItemKind::Annotation,
                tags: vec!["deployment".to_string()],
            },
        )
    }

    fn metric_spike(offset_secs: i64) -> Evidence {
        Evidence::new(
            "http_requests_5xx for api-gateway spiked to 42.0 (z-score 4.2)",
            Some(incident() + Duration::seconds(offset_secs)),
            0.9,
            EvidencePayload::Metrics {
                metric: "http_requests_5xx".to_string(),
                job: "api-gateway".to_string(),
                query: "rate(...)".to_string(),
                stats: MetricStats {
                    min: 0.0,
                    max: 42.0,
                    mean: 3.5,
                    stddev: 9.0,
                },
                anomalies: vec![MetricAnomaly {
                    time: incident() + Duration::seconds(offset_secs),
                    value: 42.0,
                    kind: verdict_core::evidence::AnomalyKind::ZScore { score: 4.2 },
                }],
            },
        )
    }

    fn correlator() -> TimelineCorrelator {
        TimelineCorrelator::new(&Config::default())
    }

    fn by_source(items: Vec<Evidence>) -> BTreeMap<SourceKind, Vec<Evidence>> {
        let mut map: BTreeMap<SourceKind, Vec<Evidence>> = BTreeMap::new();
        for ev in items {
            map.entry(ev.source()).or_default().push(ev);
        }
        map
    }

    #[test]
    fn events_are_time_ordered_and_reference_evidence() {
        let evidence = by_source(vec![
            log_ev(5, "HTTP 500 errors starting"),
            deploy_annotation(-120),
            metric_spike(10),
        ]);
        let timeline = correlator().build(&evidence, &plan());

        assert_eq!(timeline.events.len(), 3);
        assert!(timeline
            .events
            .windows(2)
            .all(|pair| pair[0].time <= pair[1].time));
        assert_eq!(timeline.events[0].source, SourceKind::Dashboard);
        for event in &timeline.events {
            assert!(evidence
                .values()
                .flatten()
                .any(|ev| ev.id == event.evidence_id));
        }
    }

    #[test]
    fn deployment_error_correlation_is_detected() {
        let evidence = by_source(vec![log_ev(5, "HTTP 500 errors starting"), deploy_annotation(-100)]);
        let timeline = correlator().build(&evidence, &plan());

        let corr = timeline
            .correlations
            .iter()
            .find(|c| c.pattern == "deployment preceded errors")
            .expect("pattern detected");
        assert_eq!(corr.sources.len(), 2);
        assert_eq!(corr.strength, CorrelationStrength::Strong);
    }

    #[test]
    fn same_source_pairs_do_not_correlate() {
        let evidence = by_source(vec![
            log_ev(0, "ERROR first failure"),
            log_ev(30, "ERROR second failure"),
        ]);
        let timeline = correlator().build(&evidence, &plan());
        assert!(timeline.correlations.is_empty());
    }

    #[test]
    fn silent_expected_source_becomes_gap() {
        let evidence = by_source(vec![log_ev(0, "only logs here")]);
        let timeline = correlator().build(&evidence, &plan());

        assert!(timeline
            .gaps
            .iter()
            .any(|g| g.missing == Some(SourceKind::Metrics)));
        assert!(timeline
            .gaps
            .iter()
            .any(|g| g.missing == Some(SourceKind::Dashboard)));
    }

    #[test]
    fn long_silent_intervals_become_gaps() {
        let evidence = by_source(vec![log_ev(-1500, "early"), log_ev(1500, "late")]);
        let timeline = correlator().build(&evidence, &plan());

        // 50 silent minutes between the two events.
        assert!(timeline
            .gaps
            .iter()
            .any(|g| g.missing.is_none() && (g.end - g.start).num_minutes() >= 45));
    }

    #[test]
    fn empty_window_is_one_whole_gap() {
        let evidence = BTreeMap::new();
        let timeline = correlator().build(&evidence, &plan());
        assert!(timeline.events.is_empty());
        assert!(timeline
            .gaps
            .iter()
            .any(|g| g.missing.is_none() && (g.end - g.start).num_minutes() >= 59));
    }

    #[test]
    fn untimed_rag_items_stay_off_the_timeline() {
        let rag = Evidence::new(
            "INC-2023-089: similar past incident",
            None,
            0.8,
            EvidencePayload::Rag {
                corpus: verdict_core::evidence::RagCorpus::Incidents,
                document_id: "INC-2023-089".to_string(),
                similarity: 0.8,
            },
        );
        let evidence = by_source(vec![rag, log_ev(0, "ERROR in window")]);
        let timeline = correlator().build(&evidence, &plan());
        assert_eq!(timeline.events.len(), 1);
        assert_eq!(timeline.events[0].source, SourceKind::Log);
    }
}
