//! Content transducer trait seams: SEO, Shorts, and voice-matching.
//!
//! The business heuristics behind these transformations are pure
//! transformations over LLM outputs and structured inputs with no systems
//! engineering content of their own. What matters here is the trait
//! boundary, the schema-validated output types, and the fact that each
//! transducer calls through the LLM fabric (and, for SEO, the trend store)
//! the same way the pipeline driver's stage handlers do. The default
//! implementations below are deliberately simple so the pipeline is runnable
//! end-to-end under `MOCK_MODE` without a real provider account.
//!
//! Mirrors the trait-seam shape of [`crate::collaborators`]: an external
//! contract expressed as an `async_trait`, with a deterministic mock
//! alongside it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ContentEngineError, Result};
use crate::llm_fabric::LlmFabric;
use crate::priority_queue::Priority;
use crate::trend_store::TrendStore;

/// Fixed set of visual-hint enum values a script segment may carry. Kept
/// closed so an out-of-set value surfaces as an `invalid_enum_value`
/// validation failure rather than being silently accepted.
pub const VISUAL_HINTS: &[&str] = &["talking_head", "b_roll", "text_overlay", "screen_share", "chart"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptSegment {
    /// `HH:MM` timestamp; validated by [`validate_script`].
    pub timestamp: String,
    pub voiceover: String,
    pub visual_hint: String,
    pub estimated_duration_seconds: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Script {
    pub segments: Vec<ScriptSegment>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeoMetadata {
    /// Region code (e.g. `en-US`, `zh-CN`) to localized SEO payload.
    pub by_region: HashMap<String, RegionSeo>,
    pub trending_keywords: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionSeo {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShortHook {
    pub segment_index: usize,
    pub emotional_trigger: String,
    pub cta: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoiceMatch {
    pub voice_id: String,
    pub confidence: f64,
}

/// Reject anything the downstream schema wouldn't accept: unknown enum
/// values, non-positive durations, malformed timestamps. Mirrors the
/// `invalid_enum_value` / `too_big` / `invalid_type` codes the error
/// classifier expects to see out of schema validation.
pub fn validate_script(script: &Script) -> Result<()> {
    for (index, segment) in script.segments.iter().enumerate() {
        if !is_hh_mm(&segment.timestamp) {
            return Err(ContentEngineError::SchemaValidation(format!(
                "invalid_string: at script.{index}.timestamp"
            )));
        }
        if !VISUAL_HINTS.contains(&segment.visual_hint.as_str()) {
            return Err(ContentEngineError::SchemaValidation(format!(
                "invalid_enum_value: at script.{index}.visual_hint"
            )));
        }
        if segment.estimated_duration_seconds <= 0.0 {
            return Err(ContentEngineError::SchemaValidation(format!(
                "too_big: at script.{index}.estimated_duration_seconds"
            )));
        }
        if segment.voiceover.trim().is_empty() {
            return Err(ContentEngineError::SchemaValidation(format!(
                "invalid_type: at script.{index}.voiceover"
            )));
        }
    }
    Ok(())
}

fn is_hh_mm(s: &str) -> bool {
    let Some((h, m)) = s.split_once(':') else { return false };
    h.len() == 2 && m.len() == 2 && h.parse::<u32>().is_ok_and(|v| v < 24) && m.parse::<u32>().is_ok_and(|v| v < 60)
}

/// Invokes the SEO transducer, which internally calls the trend store and
/// LLM fabric and yields a validated SEO object.
#[async_trait]
pub trait SeoTransducer: Send + Sync + std::fmt::Debug {
    async fn generate(&self, project_id: uuid::Uuid, script: &Script, model: &str) -> Result<SeoMetadata>;
}

/// LLM call at priority=low; the transducer emits at most 5 hooks.
#[async_trait]
pub trait ShortsTransducer: Send + Sync + std::fmt::Debug {
    async fn extract(&self, script: &Script, model: &str) -> Result<Vec<ShortHook>>;
}

/// A pure lookup — no LLM or trend call.
pub trait VoiceMatcher: Send + Sync + std::fmt::Debug {
    fn match_voice(&self, language: crate::model::Language) -> VoiceMatch;
}

/// Deterministic default SEO transducer: asks the fabric for a short tag
/// list per region, folds in whatever the trend store currently considers
/// hot, and validates the shape before returning.
#[derive(Debug)]
pub struct DefaultSeoTransducer {
    fabric: Arc<LlmFabric>,
    trends: Arc<TrendStore>,
    regions: Vec<String>,
}

impl DefaultSeoTransducer {
    pub fn new(fabric: Arc<LlmFabric>, trends: Arc<TrendStore>, regions: Vec<String>) -> Self {
        Self { fabric, trends, regions }
    }
}

#[async_trait]
impl SeoTransducer for DefaultSeoTransducer {
    async fn generate(&self, project_id: uuid::Uuid, script: &Script, model: &str) -> Result<SeoMetadata> {
        let topic = script
            .segments
            .first()
            .map(|s| s.voiceover.clone())
            .unwrap_or_default();
        let hot = self.trends.get_hot(&topic).await?;
        let trending_keywords: Vec<String> = hot.into_iter().map(|entry| entry.keyword).collect();

        let prompt = format!(
            "project={project_id} produce a title and description for each region: {:?}. Topic: {topic}",
            self.regions
        );
        let outcome = self
            .fabric
            .generate(crate::llm_fabric::GenerateRequest {
                prompt: &prompt,
                priority: Priority::Medium,
                preferred_model: Some(model),
            })
            .await?;

        let mut by_region = HashMap::new();
        for region in &self.regions {
            by_region.insert(
                region.clone(),
                RegionSeo {
                    title: format!("{topic} ({region})"),
                    description: outcome.text.clone(),
                    tags: trending_keywords.iter().take(5).cloned().collect(),
                },
            );
        }
        Ok(SeoMetadata { by_region, trending_keywords })
    }
}

/// Deterministic default shorts transducer: one hook per segment up to a
/// 5-hook cap.
#[derive(Debug)]
pub struct DefaultShortsTransducer {
    fabric: Arc<LlmFabric>,
}

impl DefaultShortsTransducer {
    pub fn new(fabric: Arc<LlmFabric>) -> Self {
        Self { fabric }
    }
}

const EMOTIONAL_TRIGGERS: &[&str] = &["curiosity", "urgency", "surprise", "fear_of_missing_out", "validation"];

#[async_trait]
impl ShortsTransducer for DefaultShortsTransducer {
    async fn extract(&self, script: &Script, model: &str) -> Result<Vec<ShortHook>> {
        let prompt = format!("generate up to 5 short-form hooks for {} segments", script.segments.len());
        let outcome = self
            .fabric
            .generate(crate::llm_fabric::GenerateRequest {
                prompt: &prompt,
                priority: Priority::Low,
                preferred_model: Some(model),
            })
            .await?;

        Ok(script
            .segments
            .iter()
            .take(5)
            .enumerate()
            .map(|(index, _)| ShortHook {
                segment_index: index,
                emotional_trigger: EMOTIONAL_TRIGGERS[index % EMOTIONAL_TRIGGERS.len()].to_string(),
                cta: format!("{} (clip {index})", outcome.text.trim()),
            })
            .collect())
    }
}

/// Deterministic default voice matcher: one voice id per detected language.
#[derive(Debug, Default)]
pub struct DefaultVoiceMatcher;

impl VoiceMatcher for DefaultVoiceMatcher {
    fn match_voice(&self, language: crate::model::Language) -> VoiceMatch {
        match language {
            crate::model::Language::En => VoiceMatch { voice_id: "en-default".to_string(), confidence: 0.9 },
            crate::model::Language::Zh => VoiceMatch { voice_id: "zh-default".to_string(), confidence: 0.9 },
        }
    }
}
