//! Durable data model: [`Project`]/[`Manifest`] and the process-owned store
//! records ([`TrendEntry`], [`HashEntry`], [`CostSnapshot`]).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Detected source-document language. Only the two the ingress watcher
/// classifies for are represented; anything else would need a new variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    En,
    Zh,
}

/// Immutable record of the document that triggered a project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSource {
    pub path: String,
    pub content: String,
    pub language: Language,
    pub word_count: u32,
    pub reading_time_minutes: f64,
}

/// Driving label for the state machine. See `state_machine` for the
/// transition table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Analyzing,
    PendingAudio,
    Rendering,
    Uploading,
    Completed,
    Failed,
    StaleRecovered,
    DegradedRetry,
    DeadLetter,
}

impl ProjectStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::DeadLetter)
    }
}

/// `{kind, code, path?, message}` — stable, serialisable classification of a
/// failure, produced exclusively by `error_classifier::classify`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    pub kind: ErrorKind,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ProviderApi,
    Network,
    Filesystem,
    Unknown,
}

/// Last-known failure recorded on a manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageError {
    pub stage: String,
    pub message: String,
    pub retries: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model_used: Option<String>,
}

/// Mutable accounting bag carried on a [`Manifest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub retry_count: u32,
    pub stale_recovery_count: u32,
    pub used_models: Vec<String>,
    pub current_model: String,
    pub is_fallback_mode: bool,
    pub is_degraded: bool,
    pub is_dead_letter: bool,
    pub cost: CostSnapshot,
    pub error_history: Vec<ErrorFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_fingerprint: Option<ErrorFingerprint>,
    pub content_hash: Option<String>,
}

impl ProjectMeta {
    pub fn new(initial_model: impl Into<String>) -> Self {
        Self {
            retry_count: 0,
            stale_recovery_count: 0,
            used_models: Vec::new(),
            current_model: initial_model.into(),
            is_fallback_mode: false,
            is_degraded: false,
            is_dead_letter: false,
            cost: CostSnapshot::default(),
            error_history: Vec::new(),
            error_fingerprint: None,
            content_hash: None,
        }
    }
}

/// Per-model output produced during stage execution; accumulated into the
/// manifest's `content_engine` bag at `MANIFEST_UPDATE`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContentEngineOutputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<crate::transducers::Script>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seo: Option<crate::transducers::SeoMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shorts: Option<Vec<crate::transducers::ShortHook>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_match: Option<crate::transducers::VoiceMatch>,
}

/// A unique project plus a distinct trace id, both generated at creation and
/// never reused.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input_source: InputSource,
    pub meta: ProjectMeta,
}

/// The durable, schema-validated record of a [`Project`] plus accumulated
/// pipeline outputs. Exactly one manifest exists per project id, at
/// `<projects_dir>/<id>/manifest.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub project: Project,
    pub status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub content_engine: ContentEngineOutputs,
}

impl Manifest {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            status: ProjectStatus::Pending,
            error: None,
            content_engine: ContentEngineOutputs::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.project.id
    }
}

/// `{keyword, first_seen, last_seen, consecutive_windows}`. Authority is a
/// pure function of `consecutive_windows`; see [`TrendAuthority`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrendEntry {
    pub keyword: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub consecutive_windows: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum TrendAuthority {
    Fleeting,
    Emerging,
    Established,
}

impl TrendEntry {
    pub fn authority(&self) -> TrendAuthority {
        match self.consecutive_windows {
            0 => unreachable!("consecutive_windows == 0 must have been removed from the store"),
            1 => TrendAuthority::Fleeting,
            2 => TrendAuthority::Emerging,
            _ => TrendAuthority::Established,
        }
    }
}

/// `{hash, size, project_id, processed_at, path}` — unique by `hash`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashEntry {
    pub hash: String,
    pub size: u64,
    pub project_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub path: String,
}

/// `{total_tokens, tokens_by_model, api_calls, estimated_cost_usd}`. Additive;
/// per-project snapshots are deltas against a captured global snapshot.
///
/// The per-project delta takes `api_calls` from the *global* ledger but
/// `total_tokens`/`tokens_by_model` from the local before/after snapshot
/// pair. Under concurrent projects this can make a project's `api_calls`
/// count include calls made by *other* in-flight projects during the same
/// window. This asymmetry is preserved intentionally rather than fixed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub total_tokens: u64,
    pub tokens_by_model: HashMap<String, u64>,
    pub api_calls: u64,
    pub estimated_cost_usd: f64,
}

impl CostSnapshot {
    /// Delta between two immutable snapshots, used for both the per-project
    /// accounting in stage `MANIFEST_UPDATE` and for tests validating the
    /// "cost additivity" invariant.
    pub fn delta(&self, earlier: &CostSnapshot) -> CostSnapshot {
        let mut tokens_by_model = HashMap::new();
        for (model, count) in &self.tokens_by_model {
            let before = earlier.tokens_by_model.get(model).copied().unwrap_or(0);
            tokens_by_model.insert(model.clone(), count.saturating_sub(before));
        }
        CostSnapshot {
            total_tokens: self.total_tokens.saturating_sub(earlier.total_tokens),
            tokens_by_model,
            api_calls: self.api_calls.saturating_sub(earlier.api_calls),
            estimated_cost_usd: self.estimated_cost_usd - earlier.estimated_cost_usd,
        }
    }
}
