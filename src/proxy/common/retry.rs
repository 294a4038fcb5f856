// Retry policies
// Exponential back-off with jitter, plus a 429 / Retry-After aware variant

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, Duration};

use super::error_classifier::{classify_error, ErrorType};
use crate::error::AppResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `base * 2^attempt` capped at `max_delay`, plus up to `jitter_factor * delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = exp.min(self.config.max_delay_ms);
        let jitter = if self.config.jitter_factor > 0.0 {
            let r: f64 = rand::thread_rng().gen();
            (capped as f64 * self.config.jitter_factor * r) as u64
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Retry any failure the classifier marks retryable, except auth failures:
    /// those already get their single cache-clearing retry from the token manager
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let classification = classify_error(&e);
                    let retryable = classification.is_retryable
                        && classification.error_type != ErrorType::AuthError;
                    if !retryable || attempt + 1 >= max_attempts {
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt + 1,
                        max_attempts,
                        classification.message,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like `execute`, but a 429 with `Retry-After` waits the server-specified
    /// duration (capped at `max_delay`). 401 is left to the caller.
    pub async fn execute_with_rate_limit<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let max_attempts = self.max_attempts();
        let max_delay = Duration::from_millis(self.config.max_delay_ms);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let classification = classify_error(&e);
                    let status = e.status_code();
                    let retryable = classification.is_retryable && status != Some(401);
                    if !retryable || attempt + 1 >= max_attempts {
                        return Err(e);
                    }

                    let delay = match (status, e.retry_after()) {
                        (Some(429), Some(wait)) => {
                            tracing::warn!(
                                "Rate limited (429), honoring Retry-After of {:?} (attempt {}/{})",
                                wait,
                                attempt + 1,
                                max_attempts
                            );
                            wait.min(max_delay)
                        }
                        _ => {
                            let delay = self.backoff_delay(attempt);
                            tracing::warn!(
                                "Upstream attempt {}/{} failed ({}), backing off {:?}",
                                attempt + 1,
                                max_attempts,
                                classification.message,
                                delay
                            );
                            delay
                        }
                    };
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Parse a `Retry-After` header value (delta-seconds form)
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_millis((secs * 1000.0) as u64));
        }
    }
    // HTTP-date form
    chrono::DateTime::parse_from_rfc2822(trimmed)
        .ok()
        .map(|at| {
            let ms = (at.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_milliseconds();
            Duration::from_millis(ms.max(0) as u64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> RetryManager {
        RetryManager::new(RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
        })
    }

    fn upstream(status: u16, retry_after: Option<Duration>) -> AppError {
        AppError::Upstream {
            status,
            body: "err".into(),
            retry_after,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = no_jitter(5);
        assert_eq!(retry.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(retry.backoff_delay(4), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_delay(80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let retry = RetryManager::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_factor: 0.5,
        });
        for _ in 0..50 {
            let d = retry.backoff_delay(0).as_millis();
            assert!((1_000..=1_500).contains(&d));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_upstream_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = no_jitter(3)
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(upstream(503, None))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: AppResult<()> = no_jitter(2)
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(upstream(500, None))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_errors_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: AppResult<()> = no_jitter(3)
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(upstream(401, None))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: AppResult<()> = no_jitter(5)
            .execute_with_rate_limit(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(upstream(400, None))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_retry_after() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        let result = no_jitter(3)
            .execute_with_rate_limit(|_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(upstream(429, Some(Duration::from_millis(700))))
                    } else {
                        Ok(1)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(700));
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_leaves_401_to_caller() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: AppResult<()> = no_jitter(3)
            .execute_with_rate_limit(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(upstream(401, None))
                }
            })
            .await;
        assert!(matches!(result, Err(AppError::Upstream { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_retry_after("soon"), None);
    }
}
