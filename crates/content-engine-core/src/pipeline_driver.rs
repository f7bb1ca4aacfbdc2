//! Pipeline Driver: the per-project coroutine that composes every other
//! component into the seven-to-eight-stage run from document ingress to
//! manifest finalization.
//!
//! The driver implements [`RecoveryHandler`] and is handed to the state
//! machine at construction, while its own reference back to the state
//! machine is a `tokio::sync::OnceCell` wired exactly once, after both sides
//! exist. This is the standard way to late-bind a callback collaborator
//! rather than having the two halves hold `Arc<Self>` of each other
//! directly.

use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::cost_ledger::CostLedger;
use crate::error::{ContentEngineError, Result};
use crate::hash_index::ContentHashIndex;
use crate::ingress_watcher::{IngressHandler, ReadyDocument};
use crate::llm_fabric::{GenerateRequest, LlmFabric};
use crate::model::{InputSource, Manifest, Project, ProjectMeta, ProjectStatus};
use crate::priority_queue::Priority;
use crate::progress_tracker::{ProgressTracker, Stage};
use crate::state_machine::{RecoveryHandler, StateMachine};
use crate::transducers::{self, Script, SeoTransducer, ShortsTransducer, VoiceMatcher};

/// Wires together the execution fabric, the transducers, and the stores a
/// single project run needs. Built before the [`StateMachine`] (so it can be
/// handed in as the recovery callback), then completed with
/// [`PipelineDriver::wire_state_machine`] once the state machine exists.
pub struct PipelineDriver {
    /// Lets `&self`-only trait methods (`IngressHandler::handle`,
    /// `RecoveryHandler::on_recovered`) spawn detached per-project tasks that
    /// need `Arc<Self>`, without the driver holding a strong reference to
    /// itself.
    self_ref: Weak<PipelineDriver>,
    state_machine: OnceCell<Arc<StateMachine>>,
    fabric: Arc<LlmFabric>,
    hash_index: Arc<ContentHashIndex>,
    cost_ledger: Arc<CostLedger>,
    seo: Arc<dyn SeoTransducer>,
    shorts: Arc<dyn ShortsTransducer>,
    voice: Arc<dyn VoiceMatcher>,
    /// `true` once the audio collaborator is wired in; FINALIZATION then
    /// targets `pending_audio` instead of `rendering`.
    audio_enabled: bool,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver").field("audio_enabled", &self.audio_enabled).finish()
    }
}

impl PipelineDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric: Arc<LlmFabric>,
        hash_index: Arc<ContentHashIndex>,
        cost_ledger: Arc<CostLedger>,
        seo: Arc<dyn SeoTransducer>,
        shorts: Arc<dyn ShortsTransducer>,
        voice: Arc<dyn VoiceMatcher>,
        audio_enabled: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            state_machine: OnceCell::new(),
            fabric,
            hash_index,
            cost_ledger,
            seo,
            shorts,
            voice,
            audio_enabled,
        })
    }

    /// Completes the wiring started in [`PipelineDriver::new`]. Must be
    /// called exactly once, after the [`StateMachine`] has been constructed
    /// with this driver as its [`RecoveryHandler`].
    pub fn wire_state_machine(&self, state_machine: Arc<StateMachine>) {
        self.state_machine
            .set(state_machine)
            .expect("wire_state_machine must be called exactly once");
    }

    fn state_machine(&self) -> &Arc<StateMachine> {
        self.state_machine.get().expect("PipelineDriver used before wire_state_machine")
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("PipelineDriver outlives its own tasks")
    }

    /// Spawns the per-project run as an independent task; errors surfaced
    /// from any stage are forwarded to `StateMachine::handle_error` rather
    /// than propagated to the caller.
    fn spawn_run(self: &Arc<Self>, id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err((stage, err)) = this.run(id).await {
                if let Err(handle_err) = this.state_machine().handle_error(id, &err, stage).await {
                    tracing::error!(project_id = %id, error = %handle_err, "failed to record pipeline error on manifest");
                }
            }
        });
    }

    /// Runs every stage starting from whatever state `id`'s manifest is
    /// currently in. Entry points: `pending` (fresh ingress) and `analyzing`
    /// (degraded-retry re-entry via [`RecoveryHandler::on_recovered`]).
    async fn run(self: &Arc<Self>, id: Uuid) -> std::result::Result<(), (&'static str, ContentEngineError)> {
        let manifest = self
            .state_machine()
            .manifests()
            .load(id)
            .await
            .map_err(|err| (Stage::Init.name(), err))?;
        let tracker = ProgressTracker::new(id, manifest.project.trace_id);

        let manifest = if manifest.status == ProjectStatus::Pending {
            tracker.log_pipeline_start(&manifest.project.input_source.path);
            tracker.start_stage(Stage::Init.name()).await;
            let updated = self
                .state_machine()
                .checked_transition(id, ProjectStatus::Analyzing)
                .await
                .map_err(|err| (Stage::Init.name(), err))?;
            tracker
                .complete_stage(Stage::Init.name(), json!({"model": updated.project.meta.current_model}))
                .await;
            updated
        } else {
            manifest
        };

        let snapshot_start = self.cost_ledger.snapshot().await;

        tracker.start_stage(Stage::ScriptGeneration.name()).await;
        let script = self
            .generate_script(&manifest)
            .await
            .map_err(|err| (Stage::ScriptGeneration.name(), err))?;
        tracker
            .complete_stage(Stage::ScriptGeneration.name(), json!({"segments": script.segments.len()}))
            .await;

        tracker.start_stage(Stage::TrendAnalysis.name()).await;
        tracker.log_sub_step(Stage::TrendAnalysis.name(), "trend lookup delegated to SEO transducer");
        tracker.complete_stage(Stage::TrendAnalysis.name(), serde_json::Value::Null).await;

        tracker.start_stage(Stage::SeoGeneration.name()).await;
        let seo = self
            .seo
            .generate(id, &script, &manifest.project.meta.current_model)
            .await
            .map_err(|err| (Stage::SeoGeneration.name(), err))?;
        tracker
            .complete_stage(Stage::SeoGeneration.name(), json!({"regions": seo.by_region.len()}))
            .await;

        tracker.start_stage(Stage::ShortsExtraction.name()).await;
        let shorts = self
            .shorts
            .extract(&script, &manifest.project.meta.current_model)
            .await
            .map_err(|err| (Stage::ShortsExtraction.name(), err))?;
        tracker.complete_stage(Stage::ShortsExtraction.name(), json!({"hooks": shorts.len()})).await;

        tracker.start_stage(Stage::VoiceMatching.name()).await;
        let voice_match = self.voice.match_voice(manifest.project.input_source.language);
        tracker.complete_stage(Stage::VoiceMatching.name(), json!({"voice_id": voice_match.voice_id})).await;

        tracker.start_stage(Stage::ManifestUpdate.name()).await;
        let snapshot_end = self.cost_ledger.snapshot().await;
        let mut cost_delta = snapshot_end.delta(&snapshot_start);
        // `api_calls` is taken from the global ledger rather than the local
        // delta; see `CostSnapshot`'s doc comment for why this asymmetry is
        // preserved rather than fixed.
        cost_delta.api_calls = snapshot_end.api_calls;
        let manifest = self
            .state_machine()
            .manifests()
            .update(id, |manifest| {
                manifest.content_engine.script = Some(script);
                manifest.content_engine.seo = Some(seo);
                manifest.content_engine.shorts = Some(shorts);
                manifest.content_engine.voice_match = Some(voice_match);
                manifest.project.meta.cost = cost_delta;
            })
            .await
            .map_err(|err| (Stage::ManifestUpdate.name(), err))?;
        tracker.complete_stage(Stage::ManifestUpdate.name(), serde_json::Value::Null).await;

        tracker.start_stage(Stage::Finalization.name()).await;
        let target = if self.audio_enabled { ProjectStatus::PendingAudio } else { ProjectStatus::Rendering };
        self.state_machine()
            .checked_transition(id, target)
            .await
            .map_err(|err| (Stage::Finalization.name(), err))?;
        if let Some(hash) = &manifest.project.meta.content_hash {
            let path = Path::new(&manifest.project.input_source.path);
            if let Err(err) = self.hash_index.mark_processed(path, hash.clone(), id).await {
                tracing::warn!(project_id = %id, error = %err, "failed to mark content hash as processed");
            }
        }
        tracker
            .complete_stage(Stage::Finalization.name(), json!({"status": format!("{target:?}")}))
            .await;
        tracker.log_pipeline_complete();

        Ok(())
    }

    async fn generate_script(&self, manifest: &Manifest) -> Result<Script> {
        let prompt = format!(
            "Produce a JSON object with a \"segments\" array describing a video script \
             for the following source document (language={:?}, word_count={}):\n\n{}",
            manifest.project.input_source.language,
            manifest.project.input_source.word_count,
            manifest.project.input_source.content,
        );
        let outcome = self
            .fabric
            .generate(GenerateRequest {
                prompt: &prompt,
                priority: Priority::High,
                preferred_model: Some(&manifest.project.meta.current_model),
            })
            .await?;
        let script: Script = serde_json::from_str(&outcome.text).map_err(|err| {
            ContentEngineError::SchemaValidation(format!("invalid_type: at script ({err})"))
        })?;
        transducers::validate_script(&script)?;
        Ok(script)
    }
}

#[async_trait]
impl IngressHandler for PipelineDriver {
    /// Dedup against the Content-Hash Index, create the project + manifest,
    /// then spawn the `pending` pipeline run.
    async fn handle(&self, document: ReadyDocument) -> Result<()> {
        let dedup = self.hash_index.is_processed(&document.processed_path).await?;
        if dedup.processed {
            tracing::info!(
                path = %document.processed_path.display(),
                method = ?dedup.method,
                "ingress document already processed, skipping"
            );
            return Ok(());
        }
        let hash = self.hash_index.hash_of(&document.processed_path).await?;

        let now = chrono::Utc::now();
        let mut meta = ProjectMeta::new(self.fabric.chain().head());
        meta.content_hash = Some(hash);
        let project = Project {
            id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            input_source: InputSource {
                path: document.processed_path.to_string_lossy().to_string(),
                content: document.content,
                language: document.language,
                word_count: document.word_count,
                reading_time_minutes: document.reading_time_minutes,
            },
            meta,
        };
        let manifest = Manifest::new(project);
        let id = manifest.id();
        self.state_machine().manifests().create(manifest).await?;

        self.arc_self().spawn_run(id);
        Ok(())
    }
}

#[async_trait]
impl RecoveryHandler for PipelineDriver {
    /// Re-enters the pipeline for a project that just landed back in
    /// `pending` (stale/failed recovery) or `analyzing` (degraded retry).
    async fn on_recovered(&self, project_id: Uuid) {
        self.arc_self().spawn_run(project_id);
    }

    /// `pending_audio → rendering` has already happened by the time this
    /// fires (the heartbeat performs that transition before invoking the
    /// callback); downstream rendering is out of scope, so there is nothing
    /// further for the driver to do beyond making the completion observable.
    async fn on_audio_ready(&self, project_id: Uuid) {
        tracing::info!(project_id = %project_id, "audio slots ready, project promoted to rendering");
    }
}
