//! Pipeline progress tracker: a trace-id scoped timer built directly on
//! `tracing` spans and events rather than a bespoke logger. The process-wide
//! tracing subscriber installed at startup is what actually renders these
//! events as newline-delimited JSON.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// The eight mandatory stages, in pipeline order. An optional
/// `AUDIO_SCRIPT_GENERATION` stage is inserted before `MANIFEST_UPDATE` when
/// the audio collaborator is enabled — represented here as a plain `&str`
/// rather than a tenth enum variant, since it is conditional.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Init,
    ScriptGeneration,
    TrendAnalysis,
    SeoGeneration,
    ShortsExtraction,
    VoiceMatching,
    ManifestUpdate,
    Finalization,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::ScriptGeneration => "SCRIPT_GENERATION",
            Stage::TrendAnalysis => "TREND_ANALYSIS",
            Stage::SeoGeneration => "SEO_GENERATION",
            Stage::ShortsExtraction => "SHORTS_EXTRACTION",
            Stage::VoiceMatching => "VOICE_MATCHING",
            Stage::ManifestUpdate => "MANIFEST_UPDATE",
            Stage::Finalization => "FINALIZATION",
        }
    }
}

/// Per-project timer state. Not `Clone`: one tracker instance lives for the
/// lifetime of a single pipeline run and is dropped with it.
#[derive(Debug)]
pub struct ProgressTracker {
    project_id: Uuid,
    trace_id: Uuid,
    pipeline_start: Instant,
    stage_starts: Mutex<HashMap<&'static str, Instant>>,
}

impl ProgressTracker {
    pub fn new(project_id: Uuid, trace_id: Uuid) -> Self {
        Self { project_id, trace_id, pipeline_start: Instant::now(), stage_starts: Mutex::new(HashMap::new()) }
    }

    pub fn log_pipeline_start(&self, input_path: &str) {
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            input_path,
            "pipeline started"
        );
    }

    pub async fn start_stage(&self, stage: &'static str) {
        self.stage_starts.lock().await.insert(stage, Instant::now());
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage,
            elapsed_ms = self.pipeline_start.elapsed().as_millis() as u64,
            "stage started"
        );
    }

    /// `context` is a free-form JSON blob merged in as a single field; pass
    /// `serde_json::Value::Null` when there's nothing stage-specific to say.
    pub async fn complete_stage(&self, stage: &'static str, context: Value) {
        let duration_ms = {
            let mut starts = self.stage_starts.lock().await;
            starts.remove(stage).map(|start| start.elapsed().as_millis() as u64).unwrap_or(0)
        };
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage,
            elapsed_ms = self.pipeline_start.elapsed().as_millis() as u64,
            stage_duration_ms = duration_ms,
            context = %context,
            "stage completed"
        );
    }

    pub fn log_sub_step(&self, stage: &'static str, message: &str) {
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage,
            elapsed_ms = self.pipeline_start.elapsed().as_millis() as u64,
            "{message}"
        );
    }

    pub fn log_pipeline_complete(&self) {
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            elapsed_ms = self.pipeline_start.elapsed().as_millis() as u64,
            finished_at = %Utc::now(),
            "pipeline completed"
        );
    }

    pub fn log_pipeline_error(&self, stage: &'static str, error: &crate::error::ContentEngineError) {
        tracing::error!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage,
            elapsed_ms = self.pipeline_start.elapsed().as_millis() as u64,
            error = %error,
            "pipeline stage failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_complete_stage_clears_timer() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), Uuid::new_v4());
        tracker.log_pipeline_start("incoming/a.md");
        tracker.start_stage(Stage::Init.name()).await;
        tracker.log_sub_step(Stage::Init.name(), "transitioned to analyzing");
        tracker.complete_stage(Stage::Init.name(), serde_json::json!({"model": "model-a"})).await;
        assert!(tracker.stage_starts.lock().await.is_empty());
        tracker.log_pipeline_complete();
    }

    #[tokio::test]
    async fn completing_unstarted_stage_reports_zero_duration() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), Uuid::new_v4());
        tracker.complete_stage(Stage::Finalization.name(), Value::Null).await;
    }
}
