//! Consecutive-window promotion / time-decay trend authority store,
//! persisted to `data/trends_authority.json`.
//!
//! Uses the same write-then-rename JSON snapshot idiom as
//! [`crate::cost_ledger`], guarded by a `tokio::sync::Mutex` since multiple
//! tasks may call in concurrently rather than assuming a single-threaded
//! executor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::cost_ledger::write_json_atomic;
use crate::error::Result;
use crate::model::{TrendAuthority, TrendEntry};

#[derive(Clone, Copy, Debug)]
pub struct TrendStoreConfig {
    pub decay_threshold: Duration,
    pub refresh_window: Duration,
}

impl Default for TrendStoreConfig {
    fn default() -> Self {
        Self { decay_threshold: Duration::from_secs(24 * 3600), refresh_window: Duration::from_secs(6 * 3600) }
    }
}

#[async_trait::async_trait]
pub trait TrendSourceClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl TrendSourceClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct State {
    entries: HashMap<String, TrendEntry>,
}

/// Process-owned singleton. `get_hot` performs decay, fetch, and promotion
/// in one call, then persists and returns the authority-sorted candidate
/// list.
pub struct TrendStore {
    path: PathBuf,
    config: TrendStoreConfig,
    source: Arc<dyn crate::collaborators::TrendSource>,
    clock: Arc<dyn TrendSourceClock>,
    state: Mutex<State>,
}

impl std::fmt::Debug for TrendStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrendStore").field("path", &self.path).finish()
    }
}

impl TrendStore {
    pub async fn load_or_new(
        path: impl Into<PathBuf>,
        config: TrendStoreConfig,
        source: Arc<dyn crate::collaborators::TrendSource>,
    ) -> Result<Self> {
        Self::load_or_new_with_clock(path, config, source, Arc::new(SystemClock)).await
    }

    pub async fn load_or_new_with_clock(
        path: impl Into<PathBuf>,
        config: TrendStoreConfig,
        source: Arc<dyn crate::collaborators::TrendSource>,
        clock: Arc<dyn TrendSourceClock>,
    ) -> Result<Self> {
        let path = path.into();
        let entries: HashMap<String, TrendEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self { path, config, source, clock, state: Mutex::new(State { entries }) })
    }

    /// Decay pass, fetch, promotion, persist, return authority-sorted
    /// candidates.
    pub async fn get_hot(&self, topic: &str) -> Result<Vec<TrendEntry>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.decay(&mut state, now);

        let candidates = match self.source.fetch(topic).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(error = %err, topic, "trend source fetch failed, degrading to empty list");
                Vec::new()
            }
        };

        for keyword in &candidates {
            self.promote(&mut state, keyword, now);
        }

        let mut sorted: Vec<TrendEntry> = state
            .entries
            .values()
            .filter(|entry| candidates.contains(&entry.keyword))
            .cloned()
            .collect();
        sorted.sort_by(|a, b| b.authority().cmp(&a.authority()).then(a.keyword.cmp(&b.keyword)));

        self.persist(&state).await;
        Ok(sorted)
    }

    /// Durable keywords: `consecutive_windows >= 3`.
    pub async fn established(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|entry| entry.authority() == TrendAuthority::Established)
            .map(|entry| entry.keyword.clone())
            .collect()
    }

    fn decay(&self, state: &mut State, now: DateTime<Utc>) {
        let threshold = chrono::Duration::from_std(self.config.decay_threshold).unwrap_or_default();
        state.entries.retain(|_, entry| {
            if now - entry.last_seen > threshold {
                entry.consecutive_windows = entry.consecutive_windows.saturating_sub(1);
            }
            entry.consecutive_windows >= 1
        });
    }

    fn promote(&self, state: &mut State, keyword: &str, now: DateTime<Utc>) {
        let refresh = chrono::Duration::from_std(self.config.refresh_window).unwrap_or_default();
        state
            .entries
            .entry(keyword.to_string())
            .and_modify(|entry| {
                if now - entry.last_seen >= refresh {
                    entry.consecutive_windows += 1;
                }
                entry.last_seen = now;
            })
            .or_insert_with(|| TrendEntry {
                keyword: keyword.to_string(),
                first_seen: now,
                last_seen: now,
                consecutive_windows: 1,
            });
    }

    async fn persist(&self, state: &State) {
        if let Err(err) = write_json_atomic(&self.path, &state.entries).await {
            tracing::warn!(error = %err, "trend store persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug)]
    struct FixedTrendSource(Vec<String>);

    #[async_trait]
    impl crate::collaborators::TrendSource for FixedTrendSource {
        async fn fetch(&self, _topic: &str) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct FakeClock(AtomicI64);
    impl FakeClock {
        fn new(start: DateTime<Utc>) -> Self {
            Self(AtomicI64::new(start.timestamp()))
        }
        fn advance(&self, d: Duration) {
            self.0.fetch_add(d.as_secs() as i64, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TrendSourceClock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp(self.0.load(Ordering::SeqCst), 0).unwrap()
        }
    }

    #[tokio::test]
    async fn first_observation_is_fleeting() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedTrendSource(vec!["rust".to_string()]));
        let store = TrendStore::load_or_new(dir.path().join("trends.json"), TrendStoreConfig::default(), source)
            .await
            .unwrap();
        let hot = store.get_hot("rust").await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].authority(), TrendAuthority::Fleeting);
    }

    #[tokio::test]
    async fn re_observation_after_refresh_window_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedTrendSource(vec!["rust".to_string()]));
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let store = TrendStore::load_or_new_with_clock(
            dir.path().join("trends.json"),
            TrendStoreConfig::default(),
            source,
            clock.clone(),
        )
        .await
        .unwrap();
        store.get_hot("rust").await.unwrap();
        clock.advance(Duration::from_secs(7 * 3600));
        let hot = store.get_hot("rust").await.unwrap();
        assert_eq!(hot[0].consecutive_windows, 2);
        assert_eq!(hot[0].authority(), TrendAuthority::Emerging);
    }

    #[tokio::test]
    async fn three_consecutive_windows_is_established() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedTrendSource(vec!["rust".to_string()]));
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let store = TrendStore::load_or_new_with_clock(
            dir.path().join("trends.json"),
            TrendStoreConfig::default(),
            source,
            clock.clone(),
        )
        .await
        .unwrap();
        for _ in 0..3 {
            store.get_hot("rust").await.unwrap();
            clock.advance(Duration::from_secs(7 * 3600));
        }
        let established = store.established().await;
        assert_eq!(established, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn decay_without_observation_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixedTrendSource(vec!["rust".to_string()]));
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let store = TrendStore::load_or_new_with_clock(
            dir.path().join("trends.json"),
            TrendStoreConfig::default(),
            source.clone(),
            clock.clone(),
        )
        .await
        .unwrap();
        store.get_hot("rust").await.unwrap();
        clock.advance(Duration::from_secs(25 * 3600));
        // Fetch a different topic so "rust" isn't re-promoted; decay still runs globally.
        let other_source: Arc<dyn crate::collaborators::TrendSource> =
            Arc::new(FixedTrendSource(Vec::new()));
        let store2 = TrendStore { source: other_source, ..store };
        store2.get_hot("anything-else").await.unwrap();
        assert!(store2.established().await.is_empty());
    }

    #[tokio::test]
    async fn source_failure_degrades_to_empty_list() {
        #[derive(Debug)]
        struct FailingSource;
        #[async_trait]
        impl crate::collaborators::TrendSource for FailingSource {
            async fn fetch(&self, _topic: &str) -> Result<Vec<String>> {
                Err(crate::error::ContentEngineError::Network("unreachable".to_string()))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let store = TrendStore::load_or_new(dir.path().join("trends.json"), TrendStoreConfig::default(), Arc::new(FailingSource))
            .await
            .unwrap();
        let hot = store.get_hot("rust").await.unwrap();
        assert!(hot.is_empty());
    }
}
