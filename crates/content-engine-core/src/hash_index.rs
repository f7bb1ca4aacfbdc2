//! Size-then-hash duplicate detection index, persisted to
//! `data/processed_hashes.json`.
//!
//! Uses the same atomic-JSON-snapshot idiom as [`crate::cost_ledger`] and
//! [`crate::trend_store`]; a `tokio::sync::OnceCell` guards the initial disk
//! load against torn concurrent reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, OnceCell};

use crate::cost_ledger::write_json_atomic;
use crate::error::Result;
use crate::model::HashEntry;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DedupMethod {
    SizeMismatch,
    HashMatch,
    HashMismatch,
}

#[derive(Clone, Debug)]
pub struct DedupResult {
    pub processed: bool,
    pub method: DedupMethod,
    pub existing: Option<HashEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    entries: HashMap<String, HashEntry>,
}

struct State {
    by_hash: HashMap<String, HashEntry>,
    by_size: HashMap<u64, Vec<String>>,
}

impl State {
    fn from_persisted(persisted: PersistedIndex) -> Self {
        let mut by_size: HashMap<u64, Vec<String>> = HashMap::new();
        for entry in persisted.entries.values() {
            by_size.entry(entry.size).or_default().push(entry.hash.clone());
        }
        Self { by_hash: persisted.entries, by_size }
    }

    fn insert(&mut self, entry: HashEntry) {
        self.by_size.entry(entry.size).or_default().push(entry.hash.clone());
        self.by_hash.insert(entry.hash.clone(), entry);
    }

    fn to_persisted(&self) -> PersistedIndex {
        PersistedIndex { entries: self.by_hash.clone() }
    }
}

/// Process-owned singleton. Initialisation is idempotent: concurrent
/// callers racing [`ContentHashIndex::ensure_loaded`] all await the same
/// one-shot load rather than tearing each other's in-memory state.
pub struct ContentHashIndex {
    path: PathBuf,
    loaded: OnceCell<()>,
    state: Mutex<Option<State>>,
}

impl std::fmt::Debug for ContentHashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHashIndex").field("path", &self.path).finish()
    }
}

impl ContentHashIndex {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into(), loaded: OnceCell::new(), state: Mutex::new(None) })
    }

    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                let persisted = match tokio::fs::read(&self.path).await {
                    Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
                    Err(_) => PersistedIndex::default(),
                };
                *self.state.lock().await = Some(State::from_persisted(persisted));
            })
            .await;
    }

    /// Stat the file; if its size has no index entries, short-circuit as
    /// `size_mismatch` without hashing. Otherwise compute a block-streamed
    /// digest and test for a hash match.
    pub async fn is_processed(&self, path: &Path) -> Result<DedupResult> {
        self.ensure_loaded().await;
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();

        let state = self.state.lock().await;
        let state = state.as_ref().expect("ensure_loaded populated state");
        if !state.by_size.contains_key(&size) {
            return Ok(DedupResult { processed: false, method: DedupMethod::SizeMismatch, existing: None });
        }
        drop(state);

        let hash = hash_file(path).await?;
        let state = self.state.lock().await;
        let state = state.as_ref().expect("ensure_loaded populated state");
        match state.by_hash.get(&hash) {
            Some(existing) => {
                Ok(DedupResult { processed: true, method: DedupMethod::HashMatch, existing: Some(existing.clone()) })
            }
            None => Ok(DedupResult { processed: false, method: DedupMethod::HashMismatch, existing: None }),
        }
    }

    /// Compute the content hash independent of `is_processed`, for callers
    /// that have already decided a file is new and want to record it.
    pub async fn hash_of(&self, path: &Path) -> Result<String> {
        hash_file(path).await
    }

    pub async fn mark_processed(&self, path: &Path, hash: String, project_id: uuid::Uuid) -> Result<()> {
        self.ensure_loaded().await;
        let metadata = tokio::fs::metadata(path).await?;
        let entry = HashEntry {
            hash,
            size: metadata.len(),
            project_id,
            processed_at: Utc::now(),
            path: path.to_string_lossy().to_string(),
        };
        let persisted = {
            let mut state = self.state.lock().await;
            let state = state.as_mut().expect("ensure_loaded populated state");
            state.insert(entry);
            state.to_persisted()
        };
        write_json_atomic(&self.path, &persisted).await
    }

    /// Removes age-expired entries, then LRU-by-`processed_at` trims to
    /// `max_entries`.
    pub async fn cleanup(&self, max_age_days: i64, max_entries: usize) -> Result<()> {
        self.ensure_loaded().await;
        let persisted = {
            let mut state = self.state.lock().await;
            let state = state.as_mut().expect("ensure_loaded populated state");
            let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
            state.by_hash.retain(|_, entry| entry.processed_at >= cutoff);

            if state.by_hash.len() > max_entries {
                let mut by_recency: Vec<(String, chrono::DateTime<Utc>)> =
                    state.by_hash.iter().map(|(h, e)| (h.clone(), e.processed_at)).collect();
                by_recency.sort_by_key(|(_, processed_at)| *processed_at);
                let excess = by_recency.len() - max_entries;
                for (hash, _) in by_recency.into_iter().take(excess) {
                    state.by_hash.remove(&hash);
                }
            }

            state.by_size.clear();
            for entry in state.by_hash.values() {
                state.by_size.entry(entry.size).or_default().push(entry.hash.clone());
            }
            state.to_persisted()
        };
        write_json_atomic(&self.path, &persisted).await
    }

    pub async fn len(&self) -> usize {
        self.ensure_loaded().await;
        self.state.lock().await.as_ref().map(|s| s.by_hash.len()).unwrap_or(0)
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[tokio::test]
    async fn unknown_size_short_circuits_without_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let index = ContentHashIndex::new(dir.path().join("hashes.json"));
        let file = write_temp(&dir, "a.md", b"hello world");
        let result = index.is_processed(&file).await.unwrap();
        assert!(!result.processed);
        assert_eq!(result.method, DedupMethod::SizeMismatch);
    }

    #[tokio::test]
    async fn mark_processed_then_is_processed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = ContentHashIndex::new(dir.path().join("hashes.json"));
        let file = write_temp(&dir, "a.md", b"hello world");
        let hash = index.hash_of(&file).await.unwrap();
        let project_id = uuid::Uuid::new_v4();
        index.mark_processed(&file, hash, project_id).await.unwrap();

        let result = index.is_processed(&file).await.unwrap();
        assert!(result.processed);
        assert_eq!(result.method, DedupMethod::HashMatch);
        assert_eq!(result.existing.unwrap().project_id, project_id);
    }

    #[tokio::test]
    async fn same_size_different_content_is_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let index = ContentHashIndex::new(dir.path().join("hashes.json"));
        let a = write_temp(&dir, "a.md", b"hello world!");
        let b = write_temp(&dir, "b.md", b"HELLO WORLD!");
        let hash_a = index.hash_of(&a).await.unwrap();
        index.mark_processed(&a, hash_a, uuid::Uuid::new_v4()).await.unwrap();

        let result = index.is_processed(&b).await.unwrap();
        assert!(!result.processed);
        assert_eq!(result.method, DedupMethod::HashMismatch);
    }

    #[tokio::test]
    async fn cleanup_trims_by_age_then_lru_cap() {
        let dir = tempfile::tempdir().unwrap();
        let index = ContentHashIndex::new(dir.path().join("hashes.json"));
        for i in 0..5 {
            let file = write_temp(&dir, &format!("f{i}.md"), format!("content-{i}").as_bytes());
            let hash = index.hash_of(&file).await.unwrap();
            index.mark_processed(&file, hash, uuid::Uuid::new_v4()).await.unwrap();
        }
        assert_eq!(index.len().await, 5);
        index.cleanup(365, 3).await.unwrap();
        assert_eq!(index.len().await, 3);
    }

    #[tokio::test]
    async fn reload_from_disk_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.json");
        let file = write_temp(&dir, "a.md", b"hello world");
        {
            let index = ContentHashIndex::new(&path);
            let hash = index.hash_of(&file).await.unwrap();
            index.mark_processed(&file, hash, uuid::Uuid::new_v4()).await.unwrap();
        }
        let reloaded = ContentHashIndex::new(&path);
        let result = reloaded.is_processed(&file).await.unwrap();
        assert!(result.processed);
    }
}
