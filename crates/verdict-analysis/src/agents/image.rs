//! Image agent: vision analysis of attached dashboard screenshots.
//!
//! Each attachment goes to a vision-capable model with a JSON-only
//! prompt; observations come back with approximate time labels that are
//! resolved against the incident date. Any failure degrades to an empty
//! result with a recorded error: screenshots never block the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use verdict_backends::llm::ImageSource;
use verdict_backends::{ChatMessage, ChatRequest, ContentBlock, LlmClient, Role};
use verdict_core::evidence::{Evidence, EvidencePayload};
use verdict_core::plan::AgentName;
use verdict_core::state::EvidencePatch;
use verdict_core::{Config, Result};

use super::{AgentContext, EvidenceAgent};
use crate::agents::planner::strip_code_fences;
use crate::prompts::IMAGE_PROMPT;

#[derive(Debug, Deserialize)]
struct VisionReport {
    #[serde(default)]
    observations: Vec<VisionObservation>,
}

#[derive(Debug, Deserialize)]
struct VisionObservation {
    description: String,
    #[serde(default)]
    approx_time: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

pub struct ImageAgent {
    config: Arc<Config>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ImageAgent {
    pub fn new(config: Arc<Config>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    async fn analyze_one(
        &self,
        llm: &dyn LlmClient,
        image: &str,
        index: usize,
        incident_time: DateTime<Utc>,
    ) -> std::result::Result<Vec<Evidence>, String> {
        let data = load_image_base64(image)?;
        let image_ref = if image.len() > 64 {
            format!("attachment-{}", index + 1)
        } else {
            image.to_string()
        };

        let message = ChatMessage {
            role: Role::User,
            content: vec![
                ContentBlock::Image {
                    source: ImageSource::base64_png(data),
                },
                ContentBlock::Text {
                    text: IMAGE_PROMPT.to_string(),
                },
            ],
        };
        let request = ChatRequest::new(&self.config.vision_model)
            .with_message(message)
            .with_max_tokens(1024);

        let response = llm.complete(request).await.map_err(|e| e.to_string())?;
        let text = response.text();

        match serde_json::from_str::<VisionReport>(strip_code_fences(&text)) {
            Ok(report) => Ok(report
                .observations
                .into_iter()
                .map(|obs| {
                    let timestamp = obs
                        .approx_time
                        .as_deref()
                        .and_then(|t| resolve_approx_time(t, incident_time));
                    let confidence = match obs.severity.as_deref() {
                        Some("critical") => 0.85,
                        Some("warning") => 0.7,
                        _ => 0.55,
                    };
                    Evidence::new(
                        obs.description.clone(),
                        timestamp,
                        confidence,
                        EvidencePayload::Image {
                            image_ref: image_ref.clone(),
                            observed: obs.severity.into_iter().collect(),
                        },
                    )
                })
                .collect()),
            Err(_) if !text.trim().is_empty() => {
                // Unstructured answer: keep the raw description.
                Ok(vec![Evidence::new(
                    text.trim().to_string(),
                    None,
                    0.5,
                    EvidencePayload::Image {
                        image_ref,
                        observed: Vec::new(),
                    },
                )])
            }
            Err(e) => Err(format!("vision output unparseable: {}", e)),
        }
    }
}

#[async_trait]
impl EvidenceAgent for ImageAgent {
    fn name(&self) -> AgentName {
        AgentName::Image
    }

    async fn collect(&self, ctx: AgentContext) -> Result<EvidencePatch> {
        if ctx.request.dashboard_images.is_empty() {
            return Ok(EvidencePatch::empty());
        }
        let llm = match &self.llm {
            Some(llm) => llm.clone(),
            None => return Ok(EvidencePatch::with_error("vision model not configured")),
        };

        let mut evidence = Vec::new();
        let mut errors = Vec::new();

        for (index, image) in ctx.request.dashboard_images.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self
                .analyze_one(llm.as_ref(), image, index, ctx.plan.incident_time)
                .await
            {
                Ok(items) => {
                    debug!(image = index, observations = items.len(), "screenshot analyzed");
                    evidence.extend(items);
                }
                Err(e) => {
                    warn!(image = index, error = %e, "screenshot analysis failed");
                    errors.push(format!("image {} analysis failed: {}", index + 1, e));
                }
            }
        }

        Ok(EvidencePatch { evidence, errors })
    }
}

/// Accept either an inline base64 payload or a readable file path.
fn load_image_base64(image: &str) -> std::result::Result<String, String> {
    let trimmed = image.trim();
    if base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .is_ok()
    {
        return Ok(trimmed.to_string());
    }
    let bytes =
        std::fs::read(trimmed).map_err(|e| format!("cannot read image {}: {}", trimmed, e))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Resolve an "HH:MM" label against the incident date.
fn resolve_approx_time(label: &str, incident_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let label = label.trim();
    if label.is_empty() || label.eq_ignore_ascii_case("null") {
        return None;
    }
    let time = NaiveTime::parse_from_str(label, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(label, "%H:%M:%S"))
        .ok()?;
    Some(incident_time.date_naive().and_time(time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn approx_time_resolution() {
        let incident = Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 0).unwrap();
        let resolved = resolve_approx_time("14:31", incident).unwrap();
        assert_eq!(
            resolved,
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 31, 0).unwrap()
        );
        assert!(resolve_approx_time("null", incident).is_none());
        assert!(resolve_approx_time("around lunch", incident).is_none());
    }

    #[test]
    fn inline_base64_is_accepted() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"png-bytes");
        assert_eq!(load_image_base64(&encoded).unwrap(), encoded);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_image_base64("/no/such/screenshot.png").is_err());
    }
}
