//! Project state machine: allowed transitions, stale thresholds,
//! heartbeat-driven recovery, retry accounting, and the terminal
//! dead-letter state.
//!
//! A concurrent manager owning state keyed by project id, with a background
//! interval task doing cleanup, generalised from an in-memory map of typed
//! states to the on-disk [`Manifest`] records persisted via
//! [`crate::manifest_store::ManifestStore`]. The cyclic reference between
//! this module and the pipeline driver is broken with a registered
//! [`RecoveryHandler`] trait object set once at wiring time, rather than the
//! state machine holding the driver's identity directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::collaborators::AudioCollaborator;
use crate::cost_ledger::write_json_atomic;
use crate::error::{ContentEngineError, Result};
use crate::error_classifier;
use crate::llm_fabric::FallbackChain;
use crate::manifest_store::ManifestStore;
use crate::model::{ErrorFingerprint, Manifest, ProjectStatus, StageError};

/// Hard schema ceiling enforced by `manifest_store::validate` regardless of
/// deployment config; also the default for `StateMachineConfig`'s
/// operational cap, which a deployment may lower (but not raise past this)
/// via its env-configured retry/stale-recovery knobs.
pub const MAX_RETRIES: u32 = 3;
pub const MAX_STALE_RECOVERY_COUNT: u32 = 3;

/// Allowed targets for a transition out of `from`; an empty slice means
/// `from` is terminal.
pub fn allowed_transitions(from: ProjectStatus) -> &'static [ProjectStatus] {
    use ProjectStatus::*;
    match from {
        Pending => &[Analyzing],
        Analyzing => &[PendingAudio, Rendering, Failed, StaleRecovered, DegradedRetry, DeadLetter],
        PendingAudio => &[Rendering, Failed, StaleRecovered, DeadLetter],
        Rendering => &[Uploading, Failed, StaleRecovered, DeadLetter],
        Uploading => &[Completed, Failed, StaleRecovered, DeadLetter],
        Failed => &[Pending, DeadLetter],
        StaleRecovered => &[Pending],
        DegradedRetry => &[Analyzing, Failed, DeadLetter],
        Completed => &[],
        DeadLetter => &[],
    }
}

/// Per-status stale threshold; absence means the status is not monitored by
/// the heartbeat. A deployment may override these defaults via
/// [`StaleThresholds`], which are among the env-configurable knobs on the CLI
/// surface.
pub fn stale_threshold(status: ProjectStatus) -> Option<Duration> {
    StaleThresholds::default().get(status)
}

/// Per-status stale thresholds, overridable at wiring time.
#[derive(Clone, Copy, Debug)]
pub struct StaleThresholds {
    pub analyzing: Duration,
    pub rendering: Duration,
    pub uploading: Duration,
    pub degraded_retry: Duration,
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self {
            analyzing: Duration::from_secs(10 * 60),
            rendering: Duration::from_secs(30 * 60),
            uploading: Duration::from_secs(5 * 60),
            degraded_retry: Duration::from_secs(15 * 60),
        }
    }
}

impl StaleThresholds {
    pub fn get(&self, status: ProjectStatus) -> Option<Duration> {
        use ProjectStatus::*;
        match status {
            Analyzing => Some(self.analyzing),
            Rendering => Some(self.rendering),
            Uploading => Some(self.uploading),
            DegradedRetry => Some(self.degraded_retry),
            _ => None,
        }
    }
}

/// Breaks the cyclic reference between the state machine and the pipeline
/// driver. The driver implements this trait and is handed to the state
/// machine at wiring time; the state machine never otherwise references the
/// driver's type.
#[async_trait]
pub trait RecoveryHandler: Send + Sync + std::fmt::Debug {
    /// Invoked after a project re-enters `pending` (from `stale_recovered`
    /// or `failed`) or `analyzing` (from `degraded_retry`) — the driver
    /// re-enters the pipeline from the appropriate stage.
    async fn on_recovered(&self, project_id: Uuid);

    /// Invoked once every configured audio language slot reports ready
    /// while a project sits in `pending_audio`.
    async fn on_audio_ready(&self, project_id: Uuid);
}

#[derive(Clone, Debug, Serialize)]
struct AlertRecord {
    project_id: Uuid,
    trace_id: Uuid,
    reason: String,
    fingerprint: Option<ErrorFingerprint>,
    retry_count: u32,
    used_models: Vec<String>,
    timestamp: chrono::DateTime<Utc>,
    severity: &'static str,
}

#[derive(Clone, Debug)]
pub struct StateMachineConfig {
    pub dead_letter_dir: PathBuf,
    pub alerts_log_path: PathBuf,
    pub stale_thresholds: StaleThresholds,
    pub max_retries: u32,
    pub max_stale_recoveries: u32,
}

impl StateMachineConfig {
    pub fn new(dead_letter_dir: impl Into<PathBuf>, alerts_log_path: impl Into<PathBuf>) -> Self {
        Self {
            dead_letter_dir: dead_letter_dir.into(),
            alerts_log_path: alerts_log_path.into(),
            stale_thresholds: StaleThresholds::default(),
            max_retries: MAX_RETRIES,
            max_stale_recoveries: MAX_STALE_RECOVERY_COUNT,
        }
    }

    pub fn with_stale_thresholds(mut self, stale_thresholds: StaleThresholds) -> Self {
        self.stale_thresholds = stale_thresholds;
        self
    }

    /// Overrides the operational retry/stale-recovery caps used by
    /// `handle_error`/`recover_stale` to decide when a project dead-letters.
    /// Independent of the hard schema ceiling `manifest_store::validate`
    /// enforces, which never changes per deployment.
    pub fn with_retry_caps(mut self, max_retries: u32, max_stale_recoveries: u32) -> Self {
        self.max_retries = max_retries;
        self.max_stale_recoveries = max_stale_recoveries;
        self
    }
}

/// Owns every [`Manifest`] on disk; all mutation funnels through
/// [`ManifestStore::update`] so the `updated_at` stamp and schema
/// validation are never bypassed.
pub struct StateMachine {
    manifests: Arc<ManifestStore>,
    chain: FallbackChain,
    audio: Arc<dyn AudioCollaborator>,
    recovery: Arc<dyn RecoveryHandler>,
    config: StateMachineConfig,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine").field("config", &self.config).finish()
    }
}

impl StateMachine {
    pub fn new(
        manifests: Arc<ManifestStore>,
        chain: FallbackChain,
        audio: Arc<dyn AudioCollaborator>,
        recovery: Arc<dyn RecoveryHandler>,
        config: StateMachineConfig,
    ) -> Self {
        Self { manifests, chain, audio, recovery, config }
    }

    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    /// Unchecked forced write of `target` onto the manifest's status — no
    /// validation against `allowed_transitions`. Internal primitive used by
    /// `checked_transition` once admissibility has already been verified,
    /// and directly by callers (`recover_stale`, `attempt_degraded_retry`)
    /// that have already established their target is legal.
    pub async fn transition(&self, id: Uuid, target: ProjectStatus) -> Result<Manifest> {
        self.manifests
            .update(id, |manifest| {
                manifest.status = target;
            })
            .await
    }

    /// Validates the transition before mutating, unlike the bare
    /// `transition` helper above which callers use once they've already
    /// checked admissibility (e.g. `recover_stale`, `attempt_degraded_retry`
    /// know their target is always legal).
    pub async fn checked_transition(&self, id: Uuid, target: ProjectStatus) -> Result<Manifest> {
        let current = self.manifests.load(id).await?.status;
        if !allowed_transitions(current).contains(&target) {
            return Err(ContentEngineError::InvalidTransition { from: current, to: target });
        }
        self.transition(id, target).await
    }

    /// Classify, record, then degrade, retry, or dead-letter.
    pub async fn handle_error(&self, id: Uuid, err: &ContentEngineError, stage: &str) -> Result<Manifest> {
        let fingerprint = error_classifier::classify(err);
        let manifest = self.manifests.load(id).await?;
        let should_degrade = error_classifier::should_degrade(&fingerprint, &manifest, self.chain.len());

        let manifest = self
            .manifests
            .update(id, |manifest| {
                manifest.project.meta.error_history.push(fingerprint.clone());
                manifest.project.meta.error_fingerprint = Some(fingerprint.clone());
                manifest.error = Some(StageError {
                    stage: stage.to_string(),
                    message: fingerprint.message.clone(),
                    retries: manifest.project.meta.retry_count,
                    timestamp: Utc::now(),
                    fallback_model_used: manifest.project.meta.used_models.last().cloned(),
                });
            })
            .await?;

        if should_degrade {
            return self.attempt_degraded_retry(id).await;
        }

        let retry_count = manifest.project.meta.retry_count + 1;
        if retry_count >= self.config.max_retries {
            return self.move_to_dead_letter(id, "retry count exhausted").await;
        }

        let manifest = self
            .manifests
            .update(id, |manifest| {
                manifest.project.meta.retry_count = retry_count;
                manifest.status = ProjectStatus::Failed;
            })
            .await?;
        Ok(manifest)
    }

    /// Picks the next unused model from the fallback chain; dead-letters if
    /// none remain.
    async fn attempt_degraded_retry(&self, id: Uuid) -> Result<Manifest> {
        let manifest = self.manifests.load(id).await?;
        let next_model = self
            .chain
            .models
            .iter()
            .find(|m| !manifest.project.meta.used_models.contains(&m.name) && m.name != manifest.project.meta.current_model);

        let Some(next_model) = next_model else {
            return self.move_to_dead_letter(id, "fallback chain exhausted").await;
        };
        let next_model = next_model.clone();

        self.manifests
            .update(id, |manifest| {
                let previous = manifest.project.meta.current_model.clone();
                manifest.project.meta.used_models.push(previous);
                manifest.project.meta.current_model = next_model.name.clone();
                manifest.project.meta.is_degraded = next_model.strict;
                manifest.project.meta.is_fallback_mode = true;
            })
            .await?;

        self.checked_transition(id, ProjectStatus::DegradedRetry).await?;
        let manifest = self.checked_transition(id, ProjectStatus::Analyzing).await?;
        self.recovery.on_recovered(id).await;
        Ok(manifest)
    }

    pub async fn move_to_dead_letter(&self, id: Uuid, reason: &str) -> Result<Manifest> {
        let manifest = self
            .manifests
            .update(id, |manifest| {
                manifest.status = ProjectStatus::DeadLetter;
                manifest.project.meta.is_dead_letter = true;
            })
            .await?;

        let ts = Utc::now().format("%Y%m%dT%H%M%S%.fZ");
        let snapshot_path = self.config.dead_letter_dir.join(format!("{id}_{ts}.json"));
        write_json_atomic(&snapshot_path, &manifest).await?;

        let alert = AlertRecord {
            project_id: id,
            trace_id: manifest.project.trace_id,
            reason: reason.to_string(),
            fingerprint: manifest.project.meta.error_fingerprint.clone(),
            retry_count: manifest.project.meta.retry_count,
            used_models: manifest.project.meta.used_models.clone(),
            timestamp: Utc::now(),
            severity: "critical",
        };
        tracing::error!(
            project_id = %alert.project_id,
            trace_id = %alert.trace_id,
            reason = %alert.reason,
            retry_count = alert.retry_count,
            severity = alert.severity,
            "project moved to dead letter"
        );
        append_alert_line(&self.config.alerts_log_path, &alert).await?;

        Ok(manifest)
    }

    /// Recovers a single stale manifest.
    async fn recover_stale(&self, id: Uuid) -> Result<Manifest> {
        let manifest = self.manifests.load(id).await?;
        if manifest.project.meta.stale_recovery_count >= self.config.max_stale_recoveries {
            let cap = self.config.max_stale_recoveries;
            let manifest = self
                .manifests
                .update(id, |manifest| {
                    manifest.status = ProjectStatus::Failed;
                    manifest.error = Some(StageError {
                        stage: "heartbeat".to_string(),
                        message: format!("stale recovery cap ({cap}) reached"),
                        retries: manifest.project.meta.retry_count,
                        timestamp: Utc::now(),
                        fallback_model_used: None,
                    });
                })
                .await?;
            return Ok(manifest);
        }

        self.manifests
            .update(id, |manifest| {
                manifest.project.meta.stale_recovery_count += 1;
                manifest.status = ProjectStatus::StaleRecovered;
            })
            .await?;
        let manifest = self
            .manifests
            .update(id, |manifest| {
                manifest.status = ProjectStatus::Pending;
            })
            .await?;
        self.recovery.on_recovered(id).await;
        Ok(manifest)
    }

    /// One heartbeat tick: scans every non-terminal manifest, recovers
    /// stale ones, and probes the audio side-channel for `pending_audio`
    /// projects. This work is O(active projects) and must not block on long
    /// I/O — each recovery/audio callback is spawned rather than awaited
    /// inline.
    pub async fn heartbeat_tick(self: &Arc<Self>) -> Result<()> {
        let now = Utc::now();
        for id in self.manifests.list_ids().await? {
            let manifest = match self.manifests.load(id).await {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(project_id = %id, error = %err, "heartbeat failed to load manifest");
                    continue;
                }
            };
            if manifest.status.is_terminal() {
                continue;
            }

            if let Some(threshold) = self.config.stale_thresholds.get(manifest.status) {
                let elapsed = now - manifest.project.updated_at;
                if elapsed > chrono::Duration::from_std(threshold).unwrap_or_default() {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.recover_stale(id).await {
                            tracing::warn!(project_id = %id, error = %err, "stale recovery failed");
                        }
                    });
                    continue;
                }
            }

            if manifest.status == ProjectStatus::PendingAudio {
                let this = self.clone();
                tokio::spawn(async move {
                    match this.audio.check_and_update_audio_status(id).await {
                        Ok(status) if status.all_ready() => {
                            if let Err(err) = this.checked_transition(id, ProjectStatus::Rendering).await {
                                tracing::warn!(project_id = %id, error = %err, "audio-ready transition failed");
                                return;
                            }
                            this.recovery.on_audio_ready(id).await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(project_id = %id, error = %err, "audio status probe failed");
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

async fn append_alert_line(path: &std::path::Path, alert: &AlertRecord) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_vec(alert)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::AudioStatus;
    use crate::llm_fabric::ModelSpec;
    use crate::model::{ErrorKind, InputSource, Language, Project, ProjectMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chain() -> FallbackChain {
        FallbackChain {
            models: vec![
                ModelSpec { name: "model-a".to_string(), strict: false },
                ModelSpec { name: "model-b".to_string(), strict: false },
                ModelSpec { name: "model-c".to_string(), strict: true },
            ],
        }
    }

    #[derive(Debug, Default)]
    struct CountingRecovery {
        recovered: AtomicUsize,
        audio_ready: AtomicUsize,
    }

    #[async_trait]
    impl RecoveryHandler for CountingRecovery {
        async fn on_recovered(&self, _project_id: Uuid) {
            self.recovered.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_audio_ready(&self, _project_id: Uuid) {
            self.audio_ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_manifest() -> Manifest {
        let now = Utc::now();
        Manifest::new(Project {
            id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            input_source: InputSource {
                path: "incoming/a.md".to_string(),
                content: "hello world".to_string(),
                language: Language::En,
                word_count: 2,
                reading_time_minutes: 0.01,
            },
            meta: ProjectMeta::new("model-a"),
        })
    }

    async fn machine(dir: &tempfile::TempDir, recovery: Arc<dyn RecoveryHandler>) -> Arc<StateMachine> {
        let manifests = Arc::new(ManifestStore::new(dir.path().join("projects")));
        Arc::new(StateMachine::new(
            manifests,
            chain(),
            Arc::new(crate::collaborators::AlwaysReadyAudioCollaborator),
            recovery,
            StateMachineConfig::new(dir.path().join("dead-letter"), dir.path().join("logs/alerts.log")),
        ))
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery).await;
        let manifest = new_manifest();
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        let err = machine.checked_transition(id, ProjectStatus::Completed).await.unwrap_err();
        assert!(matches!(err, ContentEngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn validation_degrade_moves_to_next_model() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery.clone()).await;
        let mut manifest = new_manifest();
        manifest.status = ProjectStatus::Analyzing;
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        let err = ContentEngineError::SchemaValidation("invalid_enum_value: at script.0.visual_hint".to_string());
        let updated = machine.handle_error(id, &err, "SCRIPT_GENERATION").await.unwrap();

        // The project genuinely passes through `degraded_retry` on its way
        // back to `analyzing` — `checked_transition` enforces both the
        // `analyzing -> degraded_retry` and `degraded_retry -> analyzing`
        // rows rather than forcing the status directly.
        assert_eq!(updated.status, ProjectStatus::Analyzing);
        assert_eq!(updated.project.meta.used_models, vec!["model-a".to_string()]);
        assert_eq!(updated.project.meta.current_model, "model-b");
        assert!(updated.project.meta.is_fallback_mode);
        assert_eq!(recovery.recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn degraded_retry_is_rejected_from_a_status_the_table_disallows() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery).await;
        // Only `analyzing` may transition to `degraded_retry`; a manifest
        // sitting in `uploading` must not be silently forced there.
        let mut manifest = new_manifest();
        manifest.status = ProjectStatus::Uploading;
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        let err = ContentEngineError::SchemaValidation("invalid_enum_value: at script.0.visual_hint".to_string());
        let result = machine.handle_error(id, &err, "SCRIPT_GENERATION").await;
        assert!(matches!(result, Err(ContentEngineError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn exhausted_degradation_reaches_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery).await;
        let mut manifest = new_manifest();
        manifest.project.meta.used_models = vec!["model-a".to_string(), "model-b".to_string()];
        manifest.project.meta.current_model = "model-c".to_string();
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        let err = ContentEngineError::SchemaValidation("invalid_enum_value: at script.0.visual_hint".to_string());
        let updated = machine.handle_error(id, &err, "SCRIPT_GENERATION").await.unwrap();

        assert_eq!(updated.status, ProjectStatus::DeadLetter);
        assert!(updated.project.meta.is_dead_letter);
        assert!(tokio::fs::read_to_string(dir.path().join("logs/alerts.log")).await.unwrap().contains("critical"));
        let mut dead_letter_files = tokio::fs::read_dir(dir.path().join("dead-letter")).await.unwrap();
        assert!(dead_letter_files.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_degrading_error_bumps_retry_count_until_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery).await;
        let manifest = new_manifest();
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        let err = ContentEngineError::Network("ETIMEDOUT".to_string());
        let updated = machine.handle_error(id, &err, "SCRIPT_GENERATION").await.unwrap();
        assert_eq!(updated.status, ProjectStatus::Failed);
        assert_eq!(updated.project.meta.retry_count, 1);

        let updated = machine.handle_error(id, &err, "SCRIPT_GENERATION").await.unwrap();
        assert_eq!(updated.project.meta.retry_count, 2);

        let updated = machine.handle_error(id, &err, "SCRIPT_GENERATION").await.unwrap();
        assert_eq!(updated.status, ProjectStatus::DeadLetter);
    }

    #[tokio::test]
    async fn rate_limit_error_never_degrades_even_with_chain_room() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery.clone()).await;
        let manifest = new_manifest();
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        let err = ContentEngineError::ProviderApi { code: "429_rate_limited".to_string(), message: "slow down".to_string() };
        let updated = machine.handle_error(id, &err, "SCRIPT_GENERATION").await.unwrap();
        assert_eq!(updated.status, ProjectStatus::Failed);
        assert_eq!(updated.project.meta.current_model, "model-a");
        assert_eq!(recovery.recovered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn heartbeat_recovers_stale_analyzing_project() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery.clone()).await;
        let mut manifest = new_manifest();
        manifest.status = ProjectStatus::Analyzing;
        manifest.project.updated_at = Utc::now() - chrono::Duration::minutes(11);
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        machine.heartbeat_tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reloaded = machine.manifests().load(id).await.unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Pending);
        assert_eq!(reloaded.project.meta.stale_recovery_count, 1);
        assert_eq!(recovery.recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_caps_stale_recovery_into_failed() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery).await;
        let mut manifest = new_manifest();
        manifest.status = ProjectStatus::Analyzing;
        manifest.project.meta.stale_recovery_count = MAX_STALE_RECOVERY_COUNT;
        manifest.project.updated_at = Utc::now() - chrono::Duration::minutes(11);
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        machine.heartbeat_tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reloaded = machine.manifests().load(id).await.unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn heartbeat_promotes_pending_audio_when_all_slots_ready() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(CountingRecovery::default());
        let machine = machine(&dir, recovery.clone()).await;
        let mut manifest = new_manifest();
        manifest.status = ProjectStatus::PendingAudio;
        let id = manifest.id();
        machine.manifests().create(manifest).await.unwrap();

        machine.heartbeat_tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reloaded = machine.manifests().load(id).await.unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Rendering);
        assert_eq!(recovery.audio_ready.load(Ordering::SeqCst), 1);
    }
}
