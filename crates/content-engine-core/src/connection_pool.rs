//! Bounded pool of LLM-client sessions with validation, warm-up and drain.
//!
//! `create`/`validate`/`destroy` hooks drive a bounded resource pool of
//! sessions to the LLM provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{ContentEngineError, Result};

/// A live session to the LLM provider. Construction, teardown, and liveness
/// checking are the three lifecycle hooks a pooled session needs.
#[async_trait::async_trait]
pub trait LlmSession: Send + Sync + std::fmt::Debug {
    async fn validate(&self) -> bool;
}

#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn LlmSession>>;
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

struct Idle {
    session: Arc<dyn LlmSession>,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<Idle>,
    total: usize,
    draining: bool,
}

/// Bounded pool; `warm_up()` must complete before the ingress watcher is
/// enabled.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish()
    }
}

/// RAII guard returned by [`ConnectionPool::acquire`]. The session is
/// revalidated and either returned to the idle set or destroyed on drop.
pub struct PooledSession {
    pool: Arc<ConnectionPool>,
    session: Option<Arc<dyn LlmSession>>,
}

impl std::ops::Deref for PooledSession {
    type Target = Arc<dyn LlmSession>;
    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session taken before drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(session).await;
            });
        }
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                draining: false,
            }),
            released: Notify::new(),
        })
    }

    /// Pre-opens up to `min` sessions. Must complete before ingress begins.
    pub async fn warm_up(self: &Arc<Self>) -> Result<()> {
        let target = self.config.min;
        let mut state = self.state.lock().await;
        while state.total < target {
            let session = self.factory.create().await?;
            state.idle.push_back(Idle { session, since: Instant::now() });
            state.total += 1;
        }
        Ok(())
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if state.draining {
                    return Err(ContentEngineError::PoolDraining);
                }
                while let Some(idle) = state.idle.pop_front() {
                    if idle.session.validate().await {
                        return Ok(PooledSession { pool: self.clone(), session: Some(idle.session) });
                    }
                    state.total -= 1;
                }
                if state.total < self.config.max {
                    state.total += 1;
                    drop(state);
                    match self.factory.create().await {
                        Ok(session) => {
                            return Ok(PooledSession { pool: self.clone(), session: Some(session) });
                        }
                        Err(err) => {
                            let mut state = self.state.lock().await;
                            state.total -= 1;
                            return Err(err);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ContentEngineError::PoolTimeout(self.config.acquire_timeout));
            }
            let remaining = deadline - now;
            let _ = tokio::time::timeout(remaining, self.released.notified()).await;
        }
    }

    async fn release(self: &Arc<Self>, session: Arc<dyn LlmSession>) {
        let mut state = self.state.lock().await;
        if state.draining || !session.validate().await {
            state.total = state.total.saturating_sub(1);
        } else {
            state.idle.push_back(Idle { session, since: Instant::now() });
        }
        drop(state);
        self.released.notify_one();
    }

    /// Refuses new acquires and destroys idle sessions.
    pub async fn drain(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.draining = true;
        let dropped = state.idle.len();
        state.idle.clear();
        state.total = state.total.saturating_sub(dropped);
    }

    pub async fn evict_expired_idle(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let cutoff = Instant::now() - self.config.idle_timeout;
        let before = state.idle.len();
        state.idle.retain(|idle| idle.since >= cutoff);
        let evicted = before - state.idle.len();
        state.total = state.total.saturating_sub(evicted);
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn total(&self) -> usize {
        self.state.lock().await.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeSession(usize);

    #[async_trait::async_trait]
    impl LlmSession for FakeSession {
        async fn validate(&self) -> bool {
            true
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SessionFactory for CountingFactory {
        async fn create(&self) -> Result<Arc<dyn LlmSession>> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSession(id)))
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min,
            max,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn warm_up_pre_opens_min_sessions() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(config(2, 4), factory);
        pool.warm_up().await.unwrap();
        assert_eq!(pool.total().await, 2);
        assert_eq!(pool.idle_count().await, 2);
    }

    #[tokio::test]
    async fn acquire_reuses_released_session_without_growing_pool() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(config(0, 1), factory);
        let session = pool.acquire().await.unwrap();
        drop(session);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _session2 = pool.acquire().await.unwrap();
        assert_eq!(pool.total().await, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_exhausted() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(config(0, 1), factory);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ContentEngineError::PoolTimeout(_)));
    }

    #[tokio::test]
    async fn drain_rejects_new_acquires() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(config(1, 1), factory);
        pool.warm_up().await.unwrap();
        pool.drain().await;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ContentEngineError::PoolDraining));
    }
}
