// Connection reuse tracker
// Logical per-host descriptors: keep-alive intent, idle expiry and pool stats.
// Sockets themselves are owned by reqwest's connection pool.

use dashmap::DashMap;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle_time_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_time_ms: 30_000,
            request_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub id: String,
    pub created_at: Instant,
    pub last_used: Instant,
    /// Requests currently riding on this descriptor
    pub active: usize,
}

impl PooledConnection {
    pub fn in_use(&self) -> bool {
        self.active > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub max: usize,
}

/// Headers and timeout applied to an outbound call
#[derive(Debug, Clone)]
pub struct RequestHints {
    pub headers: HeaderMap,
    pub timeout: Duration,
}

pub struct ConnectionPool {
    config: PoolConfig,
    connections: DashMap<String, PooledConnection>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
        }
    }

    fn max_idle(&self) -> Duration {
        Duration::from_millis(self.config.max_idle_time_ms)
    }

    /// `scheme://host[:port]`
    pub fn host_key(url: &str) -> AppResult<String> {
        let parsed = url::Url::parse(url)
            .map_err(|e| AppError::Config(format!("Invalid upstream URL {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Config(format!("Upstream URL has no host: {}", url)))?;
        Ok(match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        })
    }

    /// Mark the host descriptor in use, creating or replacing it as needed.
    /// The returned lease releases the descriptor on drop.
    pub fn acquire(self: &Arc<Self>, url: &str) -> AppResult<ConnectionLease> {
        let key = Self::host_key(url)?;
        let now = Instant::now();
        let max_idle = self.max_idle();

        if !self.connections.contains_key(&key)
            && self.connections.len() >= self.config.max_connections
        {
            self.cleanup();
            if self.connections.len() >= self.config.max_connections {
                tracing::warn!(
                    "Connection tracker at capacity ({}), tracking {} anyway",
                    self.config.max_connections,
                    key
                );
            }
        }

        let mut entry = self
            .connections
            .entry(key.clone())
            .or_insert_with(|| PooledConnection {
                id: key.clone(),
                created_at: now,
                last_used: now,
                active: 0,
            });

        if !entry.in_use() && now.saturating_duration_since(entry.last_used) > max_idle {
            tracing::debug!("Connection descriptor {} idle too long, replacing", key);
            *entry = PooledConnection {
                id: key.clone(),
                created_at: now,
                last_used: now,
                active: 0,
            };
        }

        entry.active += 1;
        entry.last_used = now;
        drop(entry);

        Ok(ConnectionLease {
            pool: self.clone(),
            key,
        })
    }

    fn release(&self, key: &str) {
        if let Some(mut entry) = self.connections.get_mut(key) {
            entry.active = entry.active.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    /// Purge expired, unused descriptors. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.max_idle();
        let before = self.connections.len();
        self.connections
            .retain(|_, c| c.in_use() || now.saturating_duration_since(c.last_used) <= max_idle);
        let removed = before.saturating_sub(self.connections.len());
        if removed > 0 {
            tracing::debug!("Connection tracker purged {} idle descriptors", removed);
        }
        removed
    }

    pub fn request_hints(&self) -> RequestHints {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );
        RequestHints {
            headers,
            timeout: Duration::from_millis(self.config.request_timeout_ms),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.connections.len();
        let active = self.connections.iter().filter(|c| c.in_use()).count();
        PoolStats {
            active,
            idle: total - active,
            total,
            max: self.config.max_connections,
        }
    }

    pub fn get(&self, url: &str) -> Option<PooledConnection> {
        let key = Self::host_key(url).ok()?;
        self.connections.get(&key).map(|c| c.clone())
    }
}

/// In-use marker for one outbound call
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    key: String,
}

impl ConnectionLease {
    pub fn host_key(&self) -> &str {
        &self.key
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}
