//! Durable per-project JSON manifest store at
//! `<projects_dir>/<id>/manifest.json`, with schema validation on every
//! read and write.
//!
//! Uses the same write-then-rename whole-file rewrite idiom as this crate's
//! other persisted stores (`cost_ledger`, `trend_store`, `hash_index`);
//! unlike those, each manifest gets its own subdirectory so sibling
//! script/audio artifacts can live alongside it.

use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;

use crate::cost_ledger::write_json_atomic;
use crate::error::{ContentEngineError, Result};
use crate::model::{Manifest, ProjectStatus};
use crate::transducers::VISUAL_HINTS;

/// Durable store for [`Manifest`] records. `update` is the only sanctioned
/// mutation path: load, apply the closure, stamp `updated_at`, validate,
/// save. Every manifest is owned exclusively by the state machine; every
/// other component receives it by value and mutates it only through this
/// updater closure.
#[derive(Debug)]
pub struct ManifestStore {
    projects_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self { projects_dir: projects_dir.into() }
    }

    fn manifest_path(&self, id: Uuid) -> PathBuf {
        self.projects_dir.join(id.to_string()).join("manifest.json")
    }

    pub fn project_dir(&self, id: Uuid) -> PathBuf {
        self.projects_dir.join(id.to_string())
    }

    pub async fn create(&self, manifest: Manifest) -> Result<Manifest> {
        validate(&manifest)?;
        let path = self.manifest_path(manifest.id());
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ContentEngineError::Internal(format!(
                "manifest already exists for project {}",
                manifest.id()
            )));
        }
        write_json_atomic(&path, &manifest).await?;
        Ok(manifest)
    }

    pub async fn load(&self, id: Uuid) -> Result<Manifest> {
        let path = self.manifest_path(id);
        let bytes = tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ContentEngineError::ProjectNotFound(id)
            } else {
                ContentEngineError::Io(err)
            }
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        validate(&manifest)?;
        Ok(manifest)
    }

    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        validate(manifest)?;
        let path = self.manifest_path(manifest.id());
        write_json_atomic(&path, manifest).await
    }

    /// Load, apply `updater`, stamp `updated_at`, validate, save.
    pub async fn update<F>(&self, id: Uuid, updater: F) -> Result<Manifest>
    where
        F: FnOnce(&mut Manifest),
    {
        let mut manifest = self.load(id).await?;
        updater(&mut manifest);
        manifest.project.updated_at = Utc::now();
        self.save(&manifest).await?;
        Ok(manifest)
    }

    pub async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.projects_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(id) = Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// The manifest schema is authoritative: rejects unknown statuses (caught
/// by serde deserialization itself, since [`ProjectStatus`] is a closed
/// enum), invalid enums, and out-of-range numerics (checked here).
pub fn validate(manifest: &Manifest) -> Result<()> {
    if manifest.project.updated_at < manifest.project.created_at {
        return Err(ContentEngineError::SchemaValidation(
            "invalid_type: at project.updated_at (must be >= created_at)".to_string(),
        ));
    }
    if manifest.project.meta.retry_count > super::state_machine::MAX_RETRIES
        && manifest.status != ProjectStatus::DeadLetter
    {
        return Err(ContentEngineError::SchemaValidation(
            "too_big: at project.meta.retry_count".to_string(),
        ));
    }
    if manifest.project.meta.stale_recovery_count > super::state_machine::MAX_STALE_RECOVERY_COUNT
        && !matches!(manifest.status, ProjectStatus::Failed | ProjectStatus::DeadLetter)
    {
        return Err(ContentEngineError::SchemaValidation(
            "too_big: at project.meta.stale_recovery_count".to_string(),
        ));
    }
    if manifest.project.meta.used_models.contains(&manifest.project.meta.current_model) {
        return Err(ContentEngineError::SchemaValidation(
            "invalid_type: at project.meta.used_models (must not contain current_model)".to_string(),
        ));
    }
    if let Some(script) = &manifest.content_engine.script {
        crate::transducers::validate_script(script)?;
        for segment in &script.segments {
            if !VISUAL_HINTS.contains(&segment.visual_hint.as_str()) {
                return Err(ContentEngineError::SchemaValidation(
                    "invalid_enum_value: at content_engine.script".to_string(),
                ));
            }
        }
    }
    Ok(())
}
