// Per-request context and process-wide counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

use crate::proxy::common::utils::generate_request_id;

#[derive(Debug, Default)]
pub struct ProxyMetrics {
    total_requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    streaming_requests: AtomicU64,
    cache_hits: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub streaming_requests: u64,
    pub token_refreshes: u64,
    pub cache_hits: u64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, streaming: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if streaming {
            self.streaming_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_outcome(&self, success: bool, cache_used: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if cache_used {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Token refreshes are counted by the token manager and passed in here
    pub fn snapshot(&self, token_refreshes: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            streaming_requests: self.streaming_requests.load(Ordering::Relaxed),
            token_refreshes,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Auth,
    Transform,
    Upstream,
}

#[derive(Debug, Clone, Copy, Default)]
struct Span {
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Span {
    fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RequestTimings {
    pub auth_ms: u64,
    pub transform_ms: u64,
    pub upstream_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub start_time: Instant,
    pub model: String,
    pub action: String,
    pub is_streaming: bool,
    pub retry_count: u32,
    /// Token or project came from a cache tier rather than the network
    pub cache_used: bool,
    auth: Span,
    transform: Span,
    upstream: Span,
}

impl RequestContext {
    pub fn new(model: impl Into<String>, action: impl Into<String>, is_streaming: bool) -> Self {
        Self {
            request_id: generate_request_id(),
            start_time: Instant::now(),
            model: model.into(),
            action: action.into(),
            is_streaming,
            retry_count: 0,
            cache_used: false,
            auth: Span::default(),
            transform: Span::default(),
            upstream: Span::default(),
        }
    }

    fn span_mut(&mut self, phase: Phase) -> &mut Span {
        match phase {
            Phase::Auth => &mut self.auth,
            Phase::Transform => &mut self.transform,
            Phase::Upstream => &mut self.upstream,
        }
    }

    pub fn start(&mut self, phase: Phase) {
        self.span_mut(phase).start = Some(Instant::now());
    }

    pub fn end(&mut self, phase: Phase) {
        self.span_mut(phase).end = Some(Instant::now());
    }

    pub fn timings(&self) -> RequestTimings {
        RequestTimings {
            auth_ms: self.auth.elapsed().as_millis() as u64,
            transform_ms: self.transform.elapsed().as_millis() as u64,
            upstream_ms: self.upstream.elapsed().as_millis() as u64,
            total_ms: self.start_time.elapsed().as_millis() as u64,
        }
    }

    /// Record the outcome and log a one-line summary
    pub fn finish(
        &self,
        metrics: &ProxyMetrics,
        status: u16,
        error: Option<&str>,
    ) -> RequestTimings {
        let timings = self.timings();
        metrics.record_outcome(error.is_none() && status < 400, self.cache_used);
        match error {
            None => tracing::info!(
                request_id = %self.request_id,
                model = %self.model,
                action = %self.action,
                streaming = self.is_streaming,
                retries = self.retry_count,
                "{} {} -> {} in {}ms (auth {}ms, transform {}ms, upstream {}ms)",
                self.action,
                self.model,
                status,
                timings.total_ms,
                timings.auth_ms,
                timings.transform_ms,
                timings.upstream_ms
            ),
            Some(message) => tracing::warn!(
                request_id = %self.request_id,
                model = %self.model,
                action = %self.action,
                streaming = self.is_streaming,
                retries = self.retry_count,
                "{} {} failed with {} after {}ms: {}",
                self.action,
                self.model,
                status,
                timings.total_ms,
                message
            ),
        }
        timings
    }
}
