// Circuit Breaker
// Per-upstream state machine: CLOSED -> OPEN -> HALF_OPEN -> CLOSED

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
}

/// Read-only view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure
    pub last_failure_ago_ms: Option<u64>,
    /// Milliseconds until an OPEN breaker allows a trial call
    pub next_attempt_in_ms: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                next_attempt_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // State updates never panic midway, so a poisoned lock is still consistent
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `op` through the breaker. Fails fast with `CircuitOpen` while OPEN,
    /// otherwise records the outcome and returns the original result.
    pub async fn execute<T, F, Fut>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.before_call()?;

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn before_call(&self) -> AppResult<()> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let now = Instant::now();
        match inner.next_attempt_time {
            Some(next) if now < next => {
                tracing::debug!(
                    "[CircuitBreaker:{}] OPEN, rejecting call for another {:?}",
                    self.name,
                    next - now
                );
                Err(AppError::CircuitOpen(self.name.clone()))
            }
            _ => {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                tracing::info!("[CircuitBreaker:{}] OPEN -> HALF_OPEN", self.name);
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_time = None;
                    tracing::info!("[CircuitBreaker:{}] HALF_OPEN -> CLOSED", self.name);
                }
            }
            _ => {
                inner.failure_count = 0;
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.failure_count += 1;
        inner.last_failure_time = Some(now);

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            let from = inner.state;
            inner.state = CircuitState::Open;
            inner.success_count = 0;
            inner.next_attempt_time =
                Some(now + Duration::from_millis(self.config.reset_timeout_ms));
            tracing::warn!(
                "[CircuitBreaker:{}] {:?} -> OPEN after {} failures",
                self.name,
                from,
                inner.failure_count
            );
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.next_attempt_time = None;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_ago_ms: inner
                .last_failure_time
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            next_attempt_in_ms: inner
                .next_attempt_time
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// One breaker per logical upstream name, owned by the server state
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut list: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}
