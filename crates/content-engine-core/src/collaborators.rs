//! External collaborator contracts: the LLM provider, the trend data source,
//! and the audio side-channel. Production wiring supplies real
//! implementations; `MOCK_MODE` (and all tests) use the deterministic mocks
//! below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ContentEngineError, Result};

#[derive(Clone, Debug, Default)]
pub struct GenerationUsage {
    pub prompt_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct GenerationResponse {
    pub text: String,
    pub usage: Option<GenerationUsage>,
}

/// `generate(prompt, model) -> {text, usage?}`. No streaming, no
/// tool-calling. Implementations are expected to surface HTTP/quota failures
/// as `ContentEngineError::ProviderApi`.
#[async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    async fn generate(&self, prompt: &str, model: &str) -> Result<GenerationResponse>;
}

/// `fetch(topic) -> [keyword]`. Failures degrade gracefully to an empty list
/// by convention of the caller (trend_store), not by this trait swallowing
/// errors itself.
#[async_trait]
pub trait TrendSource: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, topic: &str) -> Result<Vec<String>>;
}

/// Per-language-slot audio readiness used by the heartbeat while a project is
/// `pending_audio`.
#[derive(Clone, Debug, Default)]
pub struct AudioStatus {
    pub ready_slots: HashMap<String, bool>,
}

impl AudioStatus {
    pub fn all_ready(&self) -> bool {
        !self.ready_slots.is_empty() && self.ready_slots.values().all(|ready| *ready)
    }
}

#[async_trait]
pub trait AudioCollaborator: Send + Sync + std::fmt::Debug {
    async fn check_and_update_audio_status(&self, project_id: uuid::Uuid) -> Result<AudioStatus>;
}

/// Deterministic mock used under `MOCK_MODE` and throughout the test suite.
/// Cycles `responses` by model so tests can script "first model fails
/// validation, second succeeds" scenarios deterministically.
#[derive(Debug, Default)]
pub struct MockLlmProvider {
    calls: AtomicUsize,
    scripted: Mutex<HashMap<String, Vec<Result<GenerationResponse>>>>,
    default_response: Mutex<Option<String>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, model: impl Into<String>, responses: Vec<Result<GenerationResponse>>) {
        self.scripted.lock().await.insert(model.into(), responses);
    }

    pub async fn set_default(&self, text: impl Into<String>) {
        *self.default_response.lock().await = Some(text.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn generate(&self, prompt: &str, model: &str) -> Result<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scripted = self.scripted.lock().await;
        if let Some(queue) = scripted.get_mut(model) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        drop(scripted);
        if let Some(text) = self.default_response.lock().await.clone() {
            return Ok(GenerationResponse {
                text,
                usage: Some(GenerationUsage {
                    prompt_tokens: Some(prompt.len() as u64 / 4),
                    output_tokens: Some(32),
                }),
            });
        }
        Ok(GenerationResponse {
            text: format!("{{\"mock\": true, \"model\": \"{model}\"}}"),
            usage: None,
        })
    }
}

/// Empty-list trend source used when no real trends API is configured.
#[derive(Debug, Default)]
pub struct NullTrendSource;

#[async_trait]
impl TrendSource for NullTrendSource {
    async fn fetch(&self, _topic: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Audio collaborator that reports every slot ready on first poll, used when
/// the audio pipeline is disabled in config.
#[derive(Debug, Default)]
pub struct AlwaysReadyAudioCollaborator;

#[async_trait]
impl AudioCollaborator for AlwaysReadyAudioCollaborator {
    async fn check_and_update_audio_status(&self, _project_id: uuid::Uuid) -> Result<AudioStatus> {
        let mut ready_slots = HashMap::new();
        ready_slots.insert("en".to_string(), true);
        Ok(AudioStatus { ready_slots })
    }
}

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
}

/// Real `generate(prompt, model) -> {text, usage?}` collaborator, backed by
/// the Gemini `generateContent` REST endpoint. A thin `reqwest::Client`
/// wrapper keyed by API key, mapping HTTP status to typed errors rather than
/// propagating `reqwest::Error` directly.
pub struct GeminiLlmProvider {
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for GeminiLlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLlmProvider").field("api_key", &"<redacted>").finish()
    }
}

impl GeminiLlmProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl LlmProvider for GeminiLlmProvider {
    async fn generate(&self, prompt: &str, model: &str) -> Result<GenerationResponse> {
        let url = format!("{GEMINI_API_BASE}/{model}:generateContent?key={}", self.api_key);
        let body = GeminiRequest { contents: vec![GeminiContent { parts: vec![GeminiPart { text: prompt }] }] };

        let response = self.client.post(&url).json(&body).send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                ContentEngineError::Network(err.to_string())
            } else {
                ContentEngineError::ProviderApi { code: "request_failed".to_string(), message: err.to_string() }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ContentEngineError::ProviderApi {
                code: "429_rate_limited".to_string(),
                message: "gemini rate limit exceeded".to_string(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ContentEngineError::ProviderApi {
                code: format!("{}_unauthorized", status.as_u16()),
                message: "gemini rejected the configured API key".to_string(),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ContentEngineError::ProviderApi { code: format!("{}_error", status.as_u16()), message });
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|err| ContentEngineError::ProviderApi { code: "invalid_response".to_string(), message: err.to_string() })?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| ContentEngineError::ProviderApi {
                code: "empty_response".to_string(),
                message: "gemini returned no candidates".to_string(),
            })?;

        let usage = parsed.usage_metadata.map(|u| GenerationUsage {
            prompt_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        });

        Ok(GenerationResponse { text, usage })
    }
}
