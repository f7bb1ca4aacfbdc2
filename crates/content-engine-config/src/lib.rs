//! Environment-driven configuration for the content engine orchestrator.
//! Each field is read with `env::var(..).unwrap_or_else(..)`, with `dotenvy`
//! loaded best-effort up front, covering the fabric/store/pipeline knobs the
//! orchestrator exposes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use content_engine_core::circuit_breaker::CircuitBreakerConfig;
use content_engine_core::connection_pool::PoolConfig;
use content_engine_core::cost_ledger::PricingTable;
use content_engine_core::error::{ContentEngineError, Result};
use content_engine_core::ingress_watcher::IngressWatcherConfig;
use content_engine_core::llm_fabric::{FallbackChain, ModelSpec, RetryConfig};
use content_engine_core::priority_queue::PriorityQueueConfig;
use content_engine_core::rate_limiter::RateLimiterConfig;
use content_engine_core::state_machine::{StaleThresholds, StateMachineConfig};
use content_engine_core::trend_store::TrendStoreConfig;

/// Fully-resolved, validated configuration. Construct via [`EngineConfig::from_env`];
/// there is no public constructor that skips validation.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub gemini_api_key: Option<String>,
    pub mock_mode: bool,
    pub log_level: String,

    pub incoming_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub data_dir: PathBuf,
    pub dead_letter_dir: PathBuf,
    pub logs_dir: PathBuf,

    pub rate_limit_rpm: f64,
    pub max_concurrency: usize,
    pub max_waiting: usize,
    pub drop_lowest: bool,

    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,

    pub heartbeat_interval: Duration,
    pub stale_thresholds: StaleThresholds,
    pub max_retries: u32,
    pub max_stale_recoveries: u32,

    pub fallback_chain: FallbackChain,
    pub seo_regions: Vec<String>,
    pub audio_enabled: bool,
    pub trend_store: TrendStoreConfig,
    pub pricing: PricingTable,
}

impl EngineConfig {
    /// Loads `.env` (missing file is not an error), reads every env var with
    /// a conservative default, then validates cross-field invariants. The
    /// first violation found is returned as a `Config` error describing it.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir: PathBuf = env_path("DATA_DIR", "./data");
        let config = Self {
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            mock_mode: env_bool("MOCK_MODE", true),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            incoming_dir: env_path("INCOMING_DIR", "./incoming"),
            processed_dir: env_path("PROCESSED_DIR", "./processed"),
            projects_dir: env_path("PROJECTS_DIR", "./projects"),
            dead_letter_dir: env_path("DEAD_LETTER_DIR", "./dead-letter"),
            logs_dir: env_path("LOGS_DIR", "./logs"),
            data_dir: data_dir.clone(),

            rate_limit_rpm: env_f64("RATE_LIMIT_RPM", 60.0),
            max_concurrency: env_usize("MAX_CONCURRENCY", 4),
            max_waiting: env_usize("MAX_WAITING", 64),
            drop_lowest: env_bool("DROP_LOWEST", true),

            pool: PoolConfig {
                min: env_usize("POOL_MIN", 1),
                max: env_usize("POOL_MAX", 4),
                idle_timeout: env_duration("POOL_IDLE_TIMEOUT", Duration::from_secs(300)),
                acquire_timeout: env_duration("POOL_ACQUIRE_TIMEOUT", Duration::from_secs(10)),
            },
            retry: RetryConfig {
                max_retries: env_u32("LLM_MAX_RETRIES", 3),
                base_delay: env_duration("LLM_BASE_DELAY", Duration::from_millis(500)),
                call_deadline: env_duration("API_TIMEOUT", Duration::from_secs(120)),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_u32("CIRCUIT_FAILURE_THRESHOLD", 5),
                reset_timeout: env_duration("CIRCUIT_RESET_TIMEOUT", Duration::from_secs(30)),
                success_threshold: env_u32("CIRCUIT_SUCCESS_THRESHOLD", 2),
            },

            heartbeat_interval: env_duration("HEARTBEAT_INTERVAL", Duration::from_secs(60)),
            stale_thresholds: StaleThresholds {
                analyzing: env_duration("STALE_ANALYZING", Duration::from_secs(10 * 60)),
                rendering: env_duration("STALE_RENDERING", Duration::from_secs(30 * 60)),
                uploading: env_duration("STALE_UPLOADING", Duration::from_secs(5 * 60)),
                degraded_retry: env_duration("STALE_DEGRADED_RETRY", Duration::from_secs(15 * 60)),
            },
            max_retries: env_u32("MAX_RETRIES", 3),
            max_stale_recoveries: env_u32("MAX_STALE_RECOVERIES", 3),

            fallback_chain: parse_fallback_chain(
                &std::env::var("FALLBACK_CHAIN")
                    .unwrap_or_else(|_| "gemini-1.5-flash,gemini-1.5-pro,gemini-1.0-pro:strict".to_string()),
            )?,
            seo_regions: std::env::var("SEO_REGIONS")
                .unwrap_or_else(|_| "en-US,en-GB".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            audio_enabled: env_bool("AUDIO_ENABLED", false),
            trend_store: TrendStoreConfig::default(),
            pricing: PricingTable::default(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pool.min > self.pool.max {
            return Err(ContentEngineError::Config(format!(
                "POOL_MIN ({}) must be <= POOL_MAX ({})",
                self.pool.min, self.pool.max
            )));
        }
        if self.fallback_chain.is_empty() {
            return Err(ContentEngineError::Config("FALLBACK_CHAIN must name at least one model".to_string()));
        }
        if self.rate_limit_rpm <= 0.0 {
            return Err(ContentEngineError::Config("RATE_LIMIT_RPM must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ContentEngineError::Config("MAX_CONCURRENCY must be at least 1".to_string()));
        }
        if !self.mock_mode && self.gemini_api_key.is_none() {
            return Err(ContentEngineError::Config(
                "GEMINI_API_KEY must be set unless MOCK_MODE=true".to_string(),
            ));
        }
        if self.max_retries > content_engine_core::state_machine::MAX_RETRIES {
            return Err(ContentEngineError::Config(format!(
                "MAX_RETRIES ({}) must not exceed the schema ceiling ({})",
                self.max_retries,
                content_engine_core::state_machine::MAX_RETRIES
            )));
        }
        if self.max_stale_recoveries > content_engine_core::state_machine::MAX_STALE_RECOVERY_COUNT {
            return Err(ContentEngineError::Config(format!(
                "MAX_STALE_RECOVERIES ({}) must not exceed the schema ceiling ({})",
                self.max_stale_recoveries,
                content_engine_core::state_machine::MAX_STALE_RECOVERY_COUNT
            )));
        }
        Ok(())
    }

    pub fn priority_queue(&self) -> PriorityQueueConfig {
        PriorityQueueConfig {
            max_in_flight: self.max_concurrency,
            max_waiting: self.max_waiting,
            drop_lowest: self.drop_lowest,
        }
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig::from_rpm(self.rate_limit_rpm)
    }

    pub fn ingress_watcher(&self) -> IngressWatcherConfig {
        IngressWatcherConfig::new(self.incoming_dir.clone(), self.processed_dir.clone())
    }

    pub fn state_machine(&self) -> StateMachineConfig {
        StateMachineConfig::new(self.dead_letter_dir.clone(), self.alerts_log_path())
            .with_retry_caps(self.max_retries, self.max_stale_recoveries)
            .with_stale_thresholds(self.stale_thresholds)
    }

    pub fn cost_report_path(&self) -> PathBuf {
        self.data_dir.join("cost_report.json")
    }

    pub fn trends_path(&self) -> PathBuf {
        self.data_dir.join("trends_authority.json")
    }

    pub fn hashes_path(&self) -> PathBuf {
        self.data_dir.join("processed_hashes.json")
    }

    pub fn alerts_log_path(&self) -> PathBuf {
        self.logs_dir.join("alerts.log")
    }
}

/// `--help`/`--version` overlay accepting no positional arguments. A handful
/// of knobs may be overridden via flags; everything else is environment-only.
#[derive(clap::Parser, Debug)]
#[command(name = "content-engine", version, about = "Document-to-manifest content pipeline orchestrator")]
pub struct Args {
    /// Overrides MOCK_MODE.
    #[arg(long, env = "MOCK_MODE")]
    pub mock_mode: Option<bool>,

    /// Overrides LOG_LEVEL.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Overrides INCOMING_DIR.
    #[arg(long, env = "INCOMING_DIR")]
    pub incoming_dir: Option<PathBuf>,

    /// Overrides MAX_CONCURRENCY.
    #[arg(long, env = "MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,
}

impl Args {
    /// Applies any flag overrides on top of an `EngineConfig` already loaded
    /// from the environment.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(mock_mode) = self.mock_mode {
            config.mock_mode = mock_mode;
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }
        if let Some(incoming_dir) = &self.incoming_dir {
            config.incoming_dir = incoming_dir.clone();
        }
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
    }
}

fn parse_fallback_chain(raw: &str) -> Result<FallbackChain> {
    let models: Vec<ModelSpec> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, flag)) if flag.eq_ignore_ascii_case("strict") => {
                ModelSpec { name: name.to_string(), strict: true }
            }
            _ => ModelSpec { name: entry.to_string(), strict: false },
        })
        .collect();
    if models.is_empty() {
        return Err(ContentEngineError::Config("FALLBACK_CHAIN parsed to zero models".to_string()));
    }
    Ok(FallbackChain { models })
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| Path::new(default).to_path_buf())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key).ok().and_then(|v| humantime::parse_duration(&v).ok()).unwrap_or(default)
}
