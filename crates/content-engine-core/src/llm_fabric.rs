//! Composes the rate limiter, priority queue, connection pool, circuit
//! breakers and cost ledger into the single `generate` call every pipeline
//! stage goes through: priority admission, rate limiting, pooled session
//! acquisition, model fallback with prompt degradation, and cost recording.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::connection_pool::ConnectionPool;
use crate::cost_ledger::CostLedger;
use crate::error::{ContentEngineError, Result};
use crate::priority_queue::{Priority, PriorityQueue};
use crate::rate_limiter::RateLimiter;

/// Ordered list of provider models; position 0 is preferred. A model's
/// "strict" marker controls whether it always receives the enumerated
/// (not just directive) prompt-degradation prefix.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub name: String,
    pub strict: bool,
}

#[derive(Clone, Debug)]
pub struct FallbackChain {
    pub models: Vec<ModelSpec>,
}

impl FallbackChain {
    pub fn index_of(&self, model: &str) -> Option<usize> {
        self.models.iter().position(|m| m.name == model)
    }

    pub fn head(&self) -> &str {
        &self.models[0].name
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub call_deadline: Duration,
}

pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub priority: Priority,
    pub preferred_model: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct GenerateOutcome {
    pub text: String,
    pub model_used: String,
    pub is_fallback_mode: bool,
    pub tokens_used: u64,
}

/// Fixed directive block prepended once prompt degradation kicks in.
const DEGRADATION_DIRECTIVE: &str = "\
You must respond in plain language using exactly the requested JSON schema. \
Keep every field within its stated length bound. Only use values from the \
closed enum sets given. Never emit a null value for a required field.\n\n";

fn strict_directive(model: &ModelSpec) -> String {
    format!(
        "{DEGRADATION_DIRECTIVE}This is a strict model ({name}): enumerate every allowed enum value and numeric bound explicitly before answering.\n\n",
        name = model.name
    )
}

pub struct LlmFabric {
    queue: Arc<PriorityQueue>,
    rate_limiter: Arc<RateLimiter>,
    pool: Arc<ConnectionPool>,
    ledger: Arc<CostLedger>,
    breakers: HashMap<String, CircuitBreaker>,
    chain: FallbackChain,
    retry: RetryConfig,
    provider: Arc<dyn crate::collaborators::LlmProvider>,
}

impl std::fmt::Debug for LlmFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFabric").field("chain", &self.chain).finish()
    }
}

impl LlmFabric {
    pub fn new(
        queue: Arc<PriorityQueue>,
        rate_limiter: Arc<RateLimiter>,
        pool: Arc<ConnectionPool>,
        ledger: Arc<CostLedger>,
        chain: FallbackChain,
        retry: RetryConfig,
        breaker_config: CircuitBreakerConfig,
        provider: Arc<dyn crate::collaborators::LlmProvider>,
    ) -> Self {
        let breakers = chain
            .models
            .iter()
            .map(|m| (m.name.clone(), CircuitBreaker::new(m.name.clone(), breaker_config)))
            .collect();
        Self { queue, rate_limiter, pool, ledger, breakers, chain, retry, provider }
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub async fn generate(&self, request: GenerateRequest<'_>) -> Result<GenerateOutcome> {
        let _admission = self.queue.enqueue(request.priority).await?;
        self.rate_limiter.acquire().await;
        let _session = self.pool.acquire().await?;

        let start_index = request
            .preferred_model
            .and_then(|m| self.chain.index_of(m))
            .unwrap_or(0);

        let mut last_err = ContentEngineError::AllModelsFailed("no models configured".to_string());
        for (offset, model) in self.chain.models[start_index..].iter().enumerate() {
            let model_index = start_index + offset;
            let is_fallback_mode = model_index > 0;
            let prompt = self.degraded_prompt(request.prompt, model, is_fallback_mode);

            match self.attempt_with_retries(&prompt, model).await {
                Ok((text, usage)) => {
                    let tokens_used = token_count(&prompt, &text, usage);
                    self.ledger.record(&model.name, tokens_used).await;
                    return Ok(GenerateOutcome {
                        text: strip_fence(&text),
                        model_used: model.name.clone(),
                        is_fallback_mode,
                        tokens_used,
                    });
                }
                Err(err) => last_err = err,
            }
        }

        Err(ContentEngineError::AllModelsFailed(last_err.to_string()))
    }

    fn degraded_prompt(&self, prompt: &str, model: &ModelSpec, is_fallback_mode: bool) -> String {
        if is_fallback_mode || model.strict {
            if model.strict {
                format!("{}{}", strict_directive(model), prompt)
            } else {
                format!("{DEGRADATION_DIRECTIVE}{prompt}")
            }
        } else {
            prompt.to_string()
        }
    }

    async fn attempt_with_retries(
        &self,
        prompt: &str,
        model: &ModelSpec,
    ) -> Result<(String, Option<crate::collaborators::GenerationUsage>)> {
        let breaker = self
            .breakers
            .get(&model.name)
            .expect("every chain model has a breaker constructed in new()");

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call = self.call_provider(prompt, &model.name);
            let result = breaker.call(|| call).await;
            match result {
                Ok(response) => return Ok((response.text, response.usage)),
                Err(err) if attempt >= self.retry.max_retries => return Err(err),
                Err(_) => {
                    let delay = decorrelated_backoff(self.retry.base_delay, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn call_provider(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<crate::collaborators::GenerationResponse> {
        tokio::time::timeout(self.retry.call_deadline, self.provider.generate(prompt, model))
            .await
            .map_err(|_| ContentEngineError::ProviderApi {
                code: "timeout".to_string(),
                message: format!("provider call to {model} exceeded deadline"),
            })?
    }
}

/// `base * 2^(n-1) * U[0.5, 1.0)` — exponential backoff with decorrelated
/// multiplicative jitter.
fn decorrelated_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let jitter = rand::rng().random_range(0.5..1.0);
    Duration::from_secs_f64(exp * jitter)
}

fn strip_fence(text: &str) -> String {
    let trimmed = text.trim();
    let trimmed = trimmed.strip_prefix("```json").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix("```").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim().to_string()
}

fn token_count(prompt: &str, response: &str, usage: Option<crate::collaborators::GenerationUsage>) -> u64 {
    if let Some(usage) = usage {
        if let (Some(p), Some(o)) = (usage.prompt_tokens, usage.output_tokens) {
            return p + o;
        }
    }
    // ceil((|prompt| + |response|) / 4)
    ((prompt.len() + response.len()) as u64 + 3) / 4
}
