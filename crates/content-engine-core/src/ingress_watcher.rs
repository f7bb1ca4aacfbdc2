//! Document ingress: stable-write file detection, language/wordcount
//! pre-analysis, and atomic move into the processed tree before dispatch.
//!
//! A `notify::RecommendedWatcher` wakes an otherwise-idle poll loop eagerly,
//! but readiness itself is still decided by an explicit stable-write poll
//! (default 2s delay, 100ms cadence) rather than trusting raw filesystem
//! events, which can arrive mid-write.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::Language;

#[derive(Clone, Debug)]
pub struct IngressWatcherConfig {
    pub incoming_dir: PathBuf,
    pub processed_dir: PathBuf,
    /// Extensions without the leading dot, compared case-insensitively.
    pub extensions: Vec<String>,
    pub stable_write_delay: Duration,
    pub poll_interval: Duration,
}

impl IngressWatcherConfig {
    pub fn new(incoming_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            incoming_dir: incoming_dir.into(),
            processed_dir: processed_dir.into(),
            extensions: vec!["md".to_string(), "txt".to_string(), "markdown".to_string()],
            stable_write_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReadyDocument {
    pub original_path: PathBuf,
    pub processed_path: PathBuf,
    pub content: String,
    pub language: Language,
    pub word_count: u32,
    pub reading_time_minutes: f64,
}

/// The project-creation side of the pipeline; implemented by whatever owns
/// the Content-Hash Index and Manifest Store (the pipeline driver's wiring
/// layer, in production).
#[async_trait]
pub trait IngressHandler: Send + Sync + std::fmt::Debug {
    async fn handle(&self, document: ReadyDocument) -> Result<()>;
}

/// Unicode-block CJK ratio ≥ 30% ⇒ `zh`; word count and reading time follow
/// the language-specific convention (Han characters at 300 cpm for `zh`,
/// whitespace tokens at 200 wpm for `en`).
pub fn classify(content: &str) -> (Language, u32, f64) {
    let non_whitespace = content.chars().filter(|c| !c.is_whitespace()).count();
    let han = content.chars().filter(|c| is_han(*c)).count();
    let ratio = if non_whitespace == 0 { 0.0 } else { han as f64 / non_whitespace as f64 };

    if ratio >= 0.3 {
        let word_count = han as u32;
        (Language::Zh, word_count, word_count as f64 / 300.0)
    } else {
        let word_count = content.split_whitespace().count() as u32;
        (Language::En, word_count, word_count as f64 / 200.0)
    }
}

fn is_han(c: char) -> bool {
    matches!(c as u32, 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF)
}

struct Candidate {
    last_size: u64,
    last_changed: Instant,
}

pub struct IngressWatcher {
    config: IngressWatcherConfig,
    handler: Arc<dyn IngressHandler>,
}

impl std::fmt::Debug for IngressWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressWatcher").field("config", &self.config).finish()
    }
}

impl IngressWatcher {
    pub fn new(config: IngressWatcherConfig, handler: Arc<dyn IngressHandler>) -> Self {
        Self { config, handler }
    }

    /// Runs until `shutdown` reports `true`. Eager wakeups from `notify`
    /// collapse into the same poll-and-check path a bare ticker would take;
    /// they only shorten latency, never substitute for the stability check.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.incoming_dir).await?;
        tokio::fs::create_dir_all(&self.config.processed_dir).await?;

        let mut fs_events = spawn_fs_watcher(self.config.incoming_dir.clone());
        let mut candidates: HashMap<PathBuf, Candidate> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(&mut candidates).await;
                }
                _ = fs_events.recv() => {
                    self.scan(&mut candidates).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, candidates: &mut HashMap<PathBuf, Candidate>) {
        let mut entries = match tokio::fs::read_dir(&self.config.incoming_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "ingress directory scan failed");
                return;
            }
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "ingress directory entry unreadable");
                    break;
                }
            };
            let path = entry.path();
            if self.should_ignore(&path) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else { continue };
            if !metadata.is_file() {
                continue;
            }

            seen.insert(path.clone());
            let size = metadata.len();
            let now = Instant::now();
            let ready = match candidates.get_mut(&path) {
                Some(candidate) if candidate.last_size == size => {
                    now.duration_since(candidate.last_changed) >= self.config.stable_write_delay
                }
                Some(candidate) => {
                    candidate.last_size = size;
                    candidate.last_changed = now;
                    false
                }
                None => {
                    candidates.insert(path.clone(), Candidate { last_size: size, last_changed: now });
                    false
                }
            };

            if ready {
                candidates.remove(&path);
                if let Err(err) = self.dispatch_ready(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "ingress move/read failed");
                }
            }
        }
        candidates.retain(|path, _| seen.contains(path));
    }

    fn should_ignore(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return true };
        if name.starts_with('.') {
            return true;
        }
        if path.starts_with(&self.config.processed_dir) {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { return true };
        !self.config.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }

    /// Reads, classifies, atomically moves, then dispatches. The move
    /// happens *before* the handler runs, so a failing handler never causes
    /// the same file to be re-picked-up on the next scan.
    async fn dispatch_ready(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let (language, word_count, reading_time_minutes) = classify(&content);

        let file_name = path.file_name().expect("is_file implies a file name").to_owned();
        let processed_path = self.config.processed_dir.join(file_name);
        tokio::fs::rename(path, &processed_path).await?;

        let document = ReadyDocument {
            original_path: path.to_path_buf(),
            processed_path: processed_path.clone(),
            content,
            language,
            word_count,
            reading_time_minutes,
        };

        if let Err(err) = self.handler.handle(document).await {
            tracing::error!(path = %processed_path.display(), error = %err, "ingress handler rejected ready document");
        }
        Ok(())
    }
}

/// Spawns a `notify` watcher on a blocking thread and forwards any event as
/// a bare wakeup; event details are discarded since the poll loop re-derives
/// readiness from disk state regardless of what fired.
fn spawn_fs_watcher(dir: PathBuf) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        use notify::Watcher;
        let (std_tx, std_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(std_tx) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::warn!(error = %err, "failed to construct filesystem watcher, falling back to polling only");
                return;
            }
        };
        if let Err(err) = watcher.watch(&dir, notify::RecursiveMode::NonRecursive) {
            tracing::warn!(error = %err, path = %dir.display(), "failed to watch incoming directory");
            return;
        }
        for event in std_rx {
            if event.is_ok() && tx.blocking_send(()).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn classifies_majority_cjk_as_zh() {
        let (lang, words, minutes) = classify("你好 世界 这是 一个 测试");
        assert_eq!(lang, Language::Zh);
        assert!(words > 0);
        assert!(minutes > 0.0);
    }

    #[test]
    fn classifies_majority_latin_as_en() {
        let (lang, words, _) = classify("hello there this is a test document");
        assert_eq!(lang, Language::En);
        assert_eq!(words, 7);
    }

    #[derive(Debug, Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<PathBuf>>,
        accepted: AtomicUsize,
    }

    #[async_trait]
    impl IngressHandler for RecordingHandler {
        async fn handle(&self, document: ReadyDocument) -> Result<()> {
            self.calls.lock().unwrap().push(document.processed_path);
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stable_file_is_moved_and_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        let processed = dir.path().join("processed");
        tokio::fs::create_dir_all(&incoming).await.unwrap();
        tokio::fs::write(incoming.join("a.md"), b"hello world").await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let mut config = IngressWatcherConfig::new(&incoming, &processed);
        config.stable_write_delay = Duration::from_millis(10);
        let watcher = IngressWatcher::new(config, handler.clone());

        let mut candidates = HashMap::new();
        watcher.scan(&mut candidates).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        watcher.scan(&mut candidates).await;

        assert_eq!(handler.accepted.load(Ordering::SeqCst), 1);
        assert!(tokio::fs::try_exists(processed.join("a.md")).await.unwrap());
        assert!(!tokio::fs::try_exists(incoming.join("a.md")).await.unwrap());
    }

    #[tokio::test]
    async fn hidden_and_disallowed_extensions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        let processed = dir.path().join("processed");
        tokio::fs::create_dir_all(&incoming).await.unwrap();
        tokio::fs::write(incoming.join(".hidden.md"), b"hi").await.unwrap();
        tokio::fs::write(incoming.join("image.png"), b"hi").await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let mut config = IngressWatcherConfig::new(&incoming, &processed);
        config.stable_write_delay = Duration::from_millis(1);
        let watcher = IngressWatcher::new(config, handler.clone());

        let mut candidates = HashMap::new();
        watcher.scan(&mut candidates).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        watcher.scan(&mut candidates).await;

        assert_eq!(handler.accepted.load(Ordering::SeqCst), 0);
    }
}
