//! Shared fixtures for unit tests across this crate's modules.

use chrono::Utc;
use uuid::Uuid;

use crate::model::{InputSource, Language, Manifest, Project, ProjectMeta};

/// A freshly created manifest for project `incoming/a.md`, model `model-a`,
/// with no history. Mirrors the `new_manifest` helper duplicated across
/// several modules' own test blocks; kept here only for fixtures shared
/// *across* module boundaries (currently just `error_classifier`).
pub fn sample_manifest() -> Manifest {
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
