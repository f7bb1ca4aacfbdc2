//! Token-bucket rate limiter with multiplicative jitter.
//!
//! Tokens refill lazily on each `acquire` call based on elapsed time rather
//! than a background ticker; when the bucket is empty the caller sleeps for
//! the jittered wait and retries once.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct RateLimiterConfig {
    pub max_tokens: f64,
    pub refill_per_sec: f64,
    pub jitter_factor: f64,
}

impl RateLimiterConfig {
    pub fn from_rpm(requests_per_minute: f64) -> Self {
        Self {
            max_tokens: requests_per_minute.max(1.0),
            refill_per_sec: requests_per_minute.max(1.0) / 60.0,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// No parameter may change once constructed; `max`/`refill_rate`/`jitter` are
/// fixed at `new` and there is no setter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.config.refill_per_sec).min(self.config.max_tokens);
            state.last_refill = now;
        }
    }

    /// Blocks until a token is available, deducting exactly one. One
    /// re-entry after the computed wait is sufficient because the bucket
    /// only grows monotonically while we hold no other lock across `.await`.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / self.config.refill_per_sec
            };
            let jitter = {
                let mut rng = rand::rng();
                rng.random_range((1.0 - self.config.jitter_factor)..=(1.0 + self.config.jitter_factor))
            };
            let sleep_secs = (wait * jitter).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
        }
    }

    pub async fn available(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens.floor() as u64
    }
}
