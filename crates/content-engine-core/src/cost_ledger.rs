//! Per-model token accounting, persisted to `data/cost_report.json`.
//!
//! An in-memory map plus a write-then-rename atomic flush, driven from async
//! code via `spawn_blocking`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::CostSnapshot;

/// Static USD-per-1k-tokens table. Unknown models fall back to a conservative
/// default rather than panicking — the engine must keep running even if a
/// fallback-chain model is added to config without a pricing entry.
#[derive(Clone, Debug)]
pub struct PricingTable {
    per_1k_tokens_usd: HashMap<String, f64>,
    default_per_1k_tokens_usd: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            per_1k_tokens_usd: HashMap::new(),
            default_per_1k_tokens_usd: 0.001,
        }
    }
}

impl PricingTable {
    pub fn with_rate(mut self, model: impl Into<String>, per_1k_tokens_usd: f64) -> Self {
        self.per_1k_tokens_usd.insert(model.into(), per_1k_tokens_usd);
        self
    }

    fn rate_for(&self, model: &str) -> f64 {
        self.per_1k_tokens_usd
            .get(model)
            .copied()
            .unwrap_or(self.default_per_1k_tokens_usd)
    }
}

struct LedgerState {
    snapshot: CostSnapshot,
}

/// Process-owned singleton. `record` is additive and best-effort persisted
/// (the caller is never blocked on the disk write completing).
pub struct CostLedger {
    path: PathBuf,
    pricing: PricingTable,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostLedger").field("path", &self.path).finish()
    }
}

impl CostLedger {
    pub async fn load_or_new(path: impl Into<PathBuf>, pricing: PricingTable) -> Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => CostSnapshot::default(),
        };
        Ok(Self { path, pricing, state: Mutex::new(LedgerState { snapshot }) })
    }

    pub async fn record(&self, model: &str, tokens: u64) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.snapshot.total_tokens += tokens;
            *state.snapshot.tokens_by_model.entry(model.to_string()).or_insert(0) += tokens;
            state.snapshot.api_calls += 1;
            state.snapshot.estimated_cost_usd += (tokens as f64 / 1000.0) * self.pricing.rate_for(model);
            state.snapshot.clone()
        };
        self.persist_best_effort(snapshot);
    }

    pub async fn snapshot(&self) -> CostSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    fn persist_best_effort(&self, snapshot: CostSnapshot) {
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(err) = write_json_atomic(&path, &snapshot).await {
                tracing::warn!(error = %err, "cost ledger persist failed");
            }
        });
    }

    /// Called during graceful shutdown to guarantee the final snapshot is on
    /// disk before the process exits.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        write_json_atomic(&self.path, &snapshot).await
    }
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_is_additive_across_models() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::load_or_new(dir.path().join("cost_report.json"), PricingTable::default())
            .await
            .unwrap();
        ledger.record("gemini-1.5-pro", 100).await;
        ledger.record("gemini-1.5-flash", 50).await;
        ledger.record("gemini-1.5-pro", 25).await;
        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.total_tokens, 175);
        assert_eq!(snapshot.api_calls, 3);
        assert_eq!(snapshot.tokens_by_model["gemini-1.5-pro"], 125);
        assert_eq!(snapshot.tokens_by_model["gemini-1.5-flash"], 50);
    }

    #[tokio::test]
    async fn flush_persists_and_reload_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost_report.json");
        let ledger = CostLedger::load_or_new(&path, PricingTable::default()).await.unwrap();
        ledger.record("gemini-1.5-pro", 42).await;
        ledger.flush().await.unwrap();

        let reloaded = CostLedger::load_or_new(&path, PricingTable::default()).await.unwrap();
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.total_tokens, 42);
    }

    #[tokio::test]
    async fn cost_additivity_over_disjoint_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::load_or_new(dir.path().join("cost_report.json"), PricingTable::default())
            .await
            .unwrap();
        let start = ledger.snapshot().await;
        ledger.record("gemini-1.5-pro", 10).await;
        let mid = ledger.snapshot().await;
        ledger.record("gemini-1.5-pro", 20).await;
        let end = ledger.snapshot().await;

        let first_half = mid.delta(&start);
        let second_half = end.delta(&mid);
        let whole = end.delta(&start);
        assert_eq!(first_half.total_tokens + second_half.total_tokens, whole.total_tokens);
    }
}
