//! Metrics agent: range queries and rule-based anomaly detection.
//!
//! For each (job, metric) pair the plan implies, issues a range query
//! over the incident window and scans the series with three rules:
//! thresholded z-score, flatline-to-zero, and step change. Series
//! without anomalies still become low-confidence evidence: "metric
//! normal" is exactly what contradiction checks need.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use verdict_backends::PrometheusClient;
use verdict_core::evidence::{
    AnomalyKind, Evidence, EvidencePayload, MetricAnomaly, MetricStats,
};
use verdict_core::plan::{AgentName, Symptom};
use verdict_core::state::EvidencePatch;
use verdict_core::{Config, Result};

use super::{AgentContext, EvidenceAgent};

/// Z-score threshold for point anomalies.
const ZSCORE_THRESHOLD: f64 = 3.0;
/// Trailing zeros needed to call a flatline.
const FLATLINE_RUN: usize = 3;
/// Level-shift ratio between window halves for a step change.
const STEP_RATIO: f64 = 2.0;

/// Query step for range queries.
const STEP_SECS: u64 = 60;

/// Caps keeping one run's query fan-out bounded.
const MAX_JOBS: usize = 3;
const MAX_METRICS_PER_JOB: usize = 6;

/// The PromQL catalog, `{job}` substituted per target.
const METRIC_CATALOG: &[(&str, &str)] = &[
    ("http_requests_rate", "rate(http_requests_total{job=\"{job}\"}[5m])"),
    ("http_requests_5xx", "rate(http_requests_total{job=\"{job}\",status=\"5xx\"}[5m])"),
    ("http_requests_4xx", "rate(http_requests_total{job=\"{job}\",status=\"4xx\"}[5m])"),
    ("latency_p99", "histogram_quantile(0.99, rate(http_request_duration_seconds_bucket{job=\"{job}\"}[5m]))"),
    ("latency_p95", "histogram_quantile(0.95, rate(http_request_duration_seconds_bucket{job=\"{job}\"}[5m]))"),
    ("latency_avg", "rate(http_request_duration_seconds_sum{job=\"{job}\"}[5m]) / rate(http_request_duration_seconds_count{job=\"{job}\"}[5m])"),
    ("cpu_usage_rate", "rate(process_cpu_seconds_total{job=\"{job}\"}[5m]) * 100"),
    ("memory_usage_mb", "process_resident_memory_bytes{job=\"{job}\"} / 1024 / 1024"),
    ("open_file_descriptors", "process_open_fds{job=\"{job}\"}"),
];

pub struct MetricsAgent {
    config: Arc<Config>,
    prometheus: Option<Arc<PrometheusClient>>,
}

impl MetricsAgent {
    pub fn new(config: Arc<Config>, prometheus: Option<Arc<PrometheusClient>>) -> Self {
        Self { config, prometheus }
    }

    /// Metrics worth collecting for the plan's symptoms.
    fn metrics_for_symptoms(symptoms: &[Symptom]) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Vec::new();
        let mut push = |name: &'static str| {
            if !names.contains(&name) {
                names.push(name);
            }
        };

        for symptom in symptoms {
            match symptom {
                Symptom::ErrorRate | Symptom::Crash => {
                    push("http_requests_rate");
                    push("http_requests_5xx");
                    push("http_requests_4xx");
                }
                Symptom::Latency => {
                    push("latency_p99");
                    push("latency_p95");
                    push("latency_avg");
                }
                Symptom::Cpu => push("cpu_usage_rate"),
                Symptom::Memory => push("memory_usage_mb"),
                Symptom::Network | Symptom::Dependency => push("open_file_descriptors"),
                Symptom::Deployment => {}
            }
        }

        if names.is_empty() {
            names = vec![
                "http_requests_rate",
                "http_requests_5xx",
                "latency_p99",
                "cpu_usage_rate",
            ];
        }
        names.truncate(MAX_METRICS_PER_JOB);
        names
    }

    async fn target_jobs(
        &self,
        client: &PrometheusClient,
        ctx: &AgentContext,
        errors: &mut Vec<String>,
    ) -> Vec<String> {
        if !ctx.plan.affected_services.is_empty() {
            let mut jobs = ctx.plan.affected_services.clone();
            jobs.truncate(MAX_JOBS);
            return jobs;
        }

        // No services named: enumerate active targets via the `up`
        // indicator and filter by request hints when present.
        match client.discover_jobs().await {
            Ok(mut jobs) => {
                if !ctx.request.services.is_empty() {
                    jobs.retain(|job| {
                        ctx.request
                            .services
                            .iter()
                            .any(|hint| job.contains(hint.as_str()))
                    });
                }
                jobs.truncate(MAX_JOBS);
                jobs
            }
            Err(e) => {
                errors.push(format!("job auto-discovery failed: {}", e));
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl EvidenceAgent for MetricsAgent {
    fn name(&self) -> AgentName {
        AgentName::Metrics
    }

    async fn collect(&self, ctx: AgentContext) -> Result<EvidencePatch> {
        let client = match &self.prometheus {
            Some(client) => client.clone(),
            None => return Ok(EvidencePatch::with_error("metrics backend not configured")),
        };

        let window = ctx.plan.window_for(AgentName::Metrics);
        let start = window.start(ctx.plan.incident_time);
        let end = window.end(ctx.plan.incident_time);

        let mut evidence = Vec::new();
        let mut errors = Vec::new();

        let jobs = self.target_jobs(&client, &ctx, &mut errors).await;
        if jobs.is_empty() {
            errors.push("no metric targets resolved for this incident".to_string());
            return Ok(EvidencePatch { evidence, errors });
        }

        let metric_names = Self::metrics_for_symptoms(&ctx.plan.symptoms);

        for job in &jobs {
            for &name in &metric_names {
                if ctx.cancel.is_cancelled() {
                    return Ok(EvidencePatch { evidence, errors });
                }

                let template = METRIC_CATALOG
                    .iter()
                    .find(|(catalog_name, _)| *catalog_name == name)
                    .map(|(_, expr)| *expr)
                    .unwrap_or(name);
                let query = template.replace("{job}", job);

                let series = match client.query_range(&query, start, end, STEP_SECS).await {
                    Ok(series) => series,
                    Err(e) => {
                        warn!(metric = name, job = %job, error = %e, "range query failed");
                        errors.push(format!("{} query failed for {}: {}", name, job, e));
                        continue;
                    }
                };

                let samples: Vec<(DateTime<Utc>, f64)> = series
                    .first()
                    .map(|s| s.samples.clone())
                    .unwrap_or_default();
                let stats = match compute_stats(&samples) {
                    Some(stats) => stats,
                    None => continue,
                };
                let anomalies = detect_anomalies(&samples, &stats);
                let confidence =
                    series_confidence(&anomalies, ctx.plan.incident_time, start, end);
                let content = describe_series(name, job, &stats, &anomalies);
                let timestamp = anomalies.first().map(|a| a.time);

                evidence.push(Evidence::new(
                    content,
                    timestamp,
                    confidence,
                    EvidencePayload::Metrics {
                        metric: name.to_string(),
                        job: job.clone(),
                        query,
                        stats,
                        anomalies,
                    },
                ));
            }
        }

        evidence.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        debug!(
            jobs = jobs.len(),
            evidence = evidence.len(),
            "metrics collection complete"
        );
        Ok(EvidencePatch { evidence, errors })
    }
}

/// Basic statistics over the window. None for an empty series.
pub fn compute_stats(samples: &[(DateTime<Utc>, f64)]) -> Option<MetricStats> {
    if samples.is_empty() {
        return None;
    }
    let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(MetricStats {
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean,
        stddev: variance.sqrt(),
    })
}

/// Apply the three anomaly rules to one series.
pub fn detect_anomalies(
    samples: &[(DateTime<Utc>, f64)],
    stats: &MetricStats,
) -> Vec<MetricAnomaly> {
    let mut anomalies = Vec::new();
    if samples.len() < FLATLINE_RUN {
        return anomalies;
    }

    // Rule 1: thresholded z-score per point.
    if stats.stddev > f64::EPSILON {
        for (time, value) in samples {
            let score = (value - stats.mean).abs() / stats.stddev;
            if score >= ZSCORE_THRESHOLD {
                anomalies.push(MetricAnomaly {
                    time: *time,
                    value: *value,
                    kind: AnomalyKind::ZScore { score },
                });
            }
        }
    }

    // Rule 2: flatline to zero: a live series that dies.
    let trailing_zeros = samples
        .iter()
        .rev()
        .take_while(|(_, v)| v.abs() < f64::EPSILON)
        .count();
    let had_signal = samples[..samples.len() - trailing_zeros]
        .iter()
        .any(|(_, v)| v.abs() > f64::EPSILON);
    if trailing_zeros >= FLATLINE_RUN && had_signal {
        let (time, value) = samples[samples.len() - trailing_zeros];
        anomalies.push(MetricAnomaly {
            time,
            value,
            kind: AnomalyKind::FlatlineToZero,
        });
    }

    // Rule 3: sustained level shift between window halves.
    let mid = samples.len() / 2;
    if mid > 0 {
        let first: f64 =
            samples[..mid].iter().map(|(_, v)| v).sum::<f64>() / mid as f64;
        let second: f64 = samples[mid..].iter().map(|(_, v)| v).sum::<f64>()
            / (samples.len() - mid) as f64;
        if first.abs() > f64::EPSILON {
            let ratio = second / first;
            if ratio >= STEP_RATIO || ratio <= 1.0 / STEP_RATIO {
                let (time, value) = samples[mid];
                anomalies.push(MetricAnomaly {
                    time,
                    value,
                    kind: AnomalyKind::StepChange {
                        delta: second - first,
                    },
                });
            }
        }
    }

    anomalies
}

fn anomaly_strength(anomaly: &MetricAnomaly) -> f64 {
    match &anomaly.kind {
        AnomalyKind::ZScore { score } => (score / (2.0 * ZSCORE_THRESHOLD)).min(1.0),
        AnomalyKind::FlatlineToZero => 0.9,
        AnomalyKind::StepChange { .. } => 0.7,
    }
}

fn series_confidence(
    anomalies: &[MetricAnomaly],
    incident_time: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    if anomalies.is_empty() {
        // Normal series are weak evidence, kept for contradiction checks.
        return 0.35;
    }

    let half_span = ((end - start).num_seconds() / 2).max(1) as f64;
    anomalies
        .iter()
        .map(|a| {
            let proximity =
                1.0 - ((a.time - incident_time).num_seconds().abs() as f64 / half_span).min(1.0);
            (0.4 + 0.6 * anomaly_strength(a)) * (0.6 + 0.4 * proximity)
        })
        .fold(0.0, f64::max)
        .clamp(0.0, 1.0)
}

fn describe_series(
    metric: &str,
    job: &str,
    stats: &MetricStats,
    anomalies: &[MetricAnomaly],
) -> String {
    match anomalies.first() {
        None => format!(
            "{} for {} stable at mean {:.2} across the window (no anomalies detected)",
            metric, job, stats.mean
        ),
        Some(anomaly) => {
            let label = match &anomaly.kind {
                AnomalyKind::ZScore { score } => {
                    format!("spiked to {:.2} (z-score {:.1})", anomaly.value, score)
                }
                AnomalyKind::FlatlineToZero => "flatlined to zero".to_string(),
                AnomalyKind::StepChange { delta } if *delta >= 0.0 => {
                    format!("stepped up by {:.2}", delta)
                }
                AnomalyKind::StepChange { delta } => format!("stepped down by {:.2}", -delta),
            };
            format!(
                "{} for {} {} at {} (window mean {:.2})",
                metric,
                job,
                label,
                anomaly.time.format("%H:%M:%S"),
                stats.mean
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    fn series(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (t0() + Duration::minutes(i as i64), *v))
            .collect()
    }

    #[test]
    fn stats_over_constant_series() {
        let stats = compute_stats(&series(&[5.0, 5.0, 5.0, 5.0])).unwrap();
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.stddev, 0.0);
        assert!(detect_anomalies(&series(&[5.0, 5.0, 5.0, 5.0]), &stats).is_empty());
    }

    #[test]
    fn zscore_catches_a_spike() {
        // A long flat baseline with one outlier.
        let mut values = vec![1.0; 29];
        values.push(12.0);
        let data = series(&values);
        let stats = compute_stats(&data).unwrap();
        let anomalies = detect_anomalies(&data, &stats);
        assert!(anomalies
            .iter()
            .any(|a| matches!(a.kind, AnomalyKind::ZScore { score } if score >= 3.0)));
    }

    #[test]
    fn flatline_to_zero_detected() {
        let data = series(&[4.0, 4.2, 3.9, 4.1, 0.0, 0.0, 0.0, 0.0]);
        let stats = compute_stats(&data).unwrap();
        let anomalies = detect_anomalies(&data, &stats);
        assert!(anomalies
            .iter()
            .any(|a| matches!(a.kind, AnomalyKind::FlatlineToZero)));
    }

    #[test]
    fn all_zero_series_is_not_a_flatline_anomaly() {
        let data = series(&[0.0, 0.0, 0.0, 0.0, 0.0]);
        let stats = compute_stats(&data).unwrap();
        let anomalies = detect_anomalies(&data, &stats);
        assert!(!anomalies
            .iter()
            .any(|a| matches!(a.kind, AnomalyKind::FlatlineToZero)));
    }

    #[test]
    fn step_change_detected() {
        let data = series(&[1.0, 1.0, 1.0, 1.0, 3.0, 3.1, 2.9, 3.0]);
        let stats = compute_stats(&data).unwrap();
        let anomalies = detect_anomalies(&data, &stats);
        assert!(anomalies
            .iter()
            .any(|a| matches!(a.kind, AnomalyKind::StepChange { delta } if delta > 0.0)));
    }

    #[test]
    fn confidence_scales_with_proximity() {
        let incident = t0() + Duration::minutes(5);
        let window = verdict_core::plan::SearchWindow::symmetric(30);
        let start = window.start(incident);
        let end = window.end(incident);

        let near = vec![MetricAnomaly {
            time: incident + Duration::minutes(1),
            value: 10.0,
            kind: AnomalyKind::ZScore { score: 5.0 },
        }];
        let far = vec![MetricAnomaly {
            time: incident + Duration::minutes(28),
            value: 10.0,
            kind: AnomalyKind::ZScore { score: 5.0 },
        }];

        let near_conf = series_confidence(&near, incident, start, end);
        let far_conf = series_confidence(&far, incident, start, end);
        assert!(near_conf > far_conf);
    }

    #[test]
    fn normal_series_keeps_low_confidence_evidence() {
        let incident = t0();
        let window = verdict_core::plan::SearchWindow::symmetric(30);
        let conf = series_confidence(&[], incident, window.start(incident), window.end(incident));
        assert!(conf < 0.5);
        assert!(conf > 0.0);
    }

    #[test]
    fn symptom_metric_selection() {
        let metrics = MetricsAgent::metrics_for_symptoms(&[Symptom::Latency]);
        assert!(metrics.contains(&"latency_p99"));
        assert!(!metrics.contains(&"memory_usage_mb"));

        let defaults = MetricsAgent::metrics_for_symptoms(&[]);
        assert!(defaults.contains(&"http_requests_5xx"));
    }

    #[test]
    fn descriptions_name_the_anomaly() {
        let stats = MetricStats {
            min: 0.0,
            max: 42.0,
            mean: 3.5,
            stddev: 9.0,
        };
        let anomaly = MetricAnomaly {
            time: t0(),
            value: 42.0,
            kind: AnomalyKind::ZScore { score: 4.2 },
        };
        let text = describe_series("http_requests_5xx", "api-gateway", &stats, &[anomaly]);
        assert!(text.contains("http_requests_5xx"));
        assert!(text.contains("z-score 4.2"));

        let normal = describe_series("pg_stat_activity_count", "postgres", &stats, &[]);
        assert!(normal.contains("no anomalies"));
    }
}
