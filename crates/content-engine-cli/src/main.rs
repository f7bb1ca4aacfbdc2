//! Process supervisor: owns `main`. Wires every component in dependency
//! order and drives the graceful shutdown handshake.
//!
//! Construction follows `Args::parse()` -> `Config::from_env()` ->
//! `tracing_subscriber::registry()...init()` -> construct services
//! bottom-up -> serve, with signal handling isolated in a dedicated task
//! feeding a channel rather than racing `select!` arms inline across the
//! whole lifetime of the process.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use content_engine_config::{Args, EngineConfig};
use content_engine_core::collaborators::{
    AlwaysReadyAudioCollaborator, AudioCollaborator, GeminiLlmProvider, LlmProvider, MockLlmProvider,
    NullTrendSource, TrendSource,
};
use content_engine_core::connection_pool::{ConnectionPool, LlmSession, SessionFactory};
use content_engine_core::cost_ledger::CostLedger;
use content_engine_core::error::Result;
use content_engine_core::hash_index::ContentHashIndex;
use content_engine_core::ingress_watcher::IngressWatcher;
use content_engine_core::llm_fabric::LlmFabric;
use content_engine_core::manifest_store::ManifestStore;
use content_engine_core::pipeline_driver::PipelineDriver;
use content_engine_core::priority_queue::PriorityQueue;
use content_engine_core::rate_limiter::RateLimiter;
use content_engine_core::state_machine::{RecoveryHandler, StateMachine};
use content_engine_core::transducers::{DefaultSeoTransducer, DefaultShortsTransducer, DefaultVoiceMatcher};
use content_engine_core::trend_store::TrendStore;

/// A connected (but otherwise stateless) mock session — the real collaborator
/// contract only asks for open/close/liveness; a single HTTP client is
/// reused across every "session" rather than opening a transport connection
/// per slot, since the Gemini REST API is stateless.
#[derive(Debug)]
struct GeminiSession;

#[async_trait::async_trait]
impl LlmSession for GeminiSession {
    async fn validate(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct GeminiSessionFactory;

#[async_trait::async_trait]
impl SessionFactory for GeminiSessionFactory {
    async fn create(&self) -> Result<Arc<dyn LlmSession>> {
        Ok(Arc::new(GeminiSession))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    install_tracing(&config.log_level);

    match run(config).await {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            std::process::exit(1);
        }
    }
}

fn install_tracing(log_level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout))
        .init();
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    tracing::info!(mock_mode = config.mock_mode, "content engine starting");

    let cost_ledger = Arc::new(CostLedger::load_or_new(config.cost_report_path(), config.pricing.clone()).await?);

    let trend_source: Arc<dyn TrendSource> = Arc::new(NullTrendSource);
    let trend_store = Arc::new(TrendStore::load_or_new(config.trends_path(), config.trend_store, trend_source).await?);

    let hash_index = ContentHashIndex::new(config.hashes_path());

    let queue = Arc::new(PriorityQueue::new(config.priority_queue()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter()));
    let pool = ConnectionPool::new(config.pool, Arc::new(GeminiSessionFactory));

    let provider: Arc<dyn LlmProvider> = if config.mock_mode {
        tracing::warn!("MOCK_MODE enabled: LLM calls are served by a deterministic in-process stub");
        let mock = Arc::new(MockLlmProvider::new());
        mock.set_default(
            r#"{"segments": [{"timestamp": "00:01", "voiceover": "placeholder", "visual_hint": "talking_head", "estimated_duration_seconds": 5.0}]}"#,
        )
        .await;
        mock
    } else {
        let api_key = config
            .gemini_api_key
            .clone()
            .expect("EngineConfig::validate guarantees GEMINI_API_KEY when MOCK_MODE is false");
        Arc::new(GeminiLlmProvider::new(api_key))
    };

    tracing::info!("warming up connection pool");
    pool.warm_up().await?;

    let fabric = Arc::new(LlmFabric::new(
        queue,
        rate_limiter,
        pool.clone(),
        cost_ledger.clone(),
        config.fallback_chain.clone(),
        config.retry,
        config.circuit_breaker,
        provider,
    ));

    let seo = Arc::new(DefaultSeoTransducer::new(fabric.clone(), trend_store.clone(), config.seo_regions.clone()));
    let shorts = Arc::new(DefaultShortsTransducer::new(fabric.clone()));
    let voice = Arc::new(DefaultVoiceMatcher);

    let driver = PipelineDriver::new(fabric, hash_index.clone(), cost_ledger.clone(), seo, shorts, voice, config.audio_enabled);

    let manifests = Arc::new(ManifestStore::new(config.projects_dir.clone()));
    let audio: Arc<dyn AudioCollaborator> = Arc::new(AlwaysReadyAudioCollaborator);
    let state_machine = Arc::new(StateMachine::new(
        manifests,
        config.fallback_chain.clone(),
        audio,
        driver.clone() as Arc<dyn RecoveryHandler>,
        config.state_machine(),
    ));
    driver.wire_state_machine(state_machine.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let heartbeat_handle = spawn_heartbeat(state_machine.clone(), config.heartbeat_interval, shutdown_rx.clone());

    let watcher = Arc::new(IngressWatcher::new(config.ingress_watcher(), driver.clone()));
    let watcher_handle = {
        let watcher = watcher.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.run(shutdown_rx).await {
                tracing::error!(error = %err, "ingress watcher exited with error");
            }
        })
    };

    tracing::info!(
        incoming_dir = %config.incoming_dir.display(),
        max_concurrency = config.max_concurrency,
        "content engine ready"
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    let _ = watcher_handle.await;
    heartbeat_handle.abort();
    pool.drain().await;
    cost_ledger.flush().await?;

    let final_snapshot = cost_ledger.snapshot().await;
    tracing::info!(
        total_tokens = final_snapshot.total_tokens,
        api_calls = final_snapshot.api_calls,
        estimated_cost_usd = final_snapshot.estimated_cost_usd,
        "final cost report"
    );

    tracing::info!("shutdown complete");
    Ok(())
}

fn spawn_heartbeat(
    state_machine: Arc<StateMachine>,
    interval: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = state_machine.heartbeat_tick().await {
                        tracing::warn!(error = %err, "heartbeat tick failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Waits on `ctrl_c` and, on unix, `SIGTERM` as well — both trigger the same
/// graceful shutdown path.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
