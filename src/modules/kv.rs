// Durable key-value store abstraction
// get / put-with-TTL / delete; absent after TTL

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::error::{AppError, AppResult};

/// Shortest TTL any store accepts
pub const MIN_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Largest TTL the backend can represent
    fn max_ttl(&self) -> Duration {
        Duration::from_secs(i32::MAX as u64)
    }
}

/// Clamp a TTL into the store's representable range
pub fn clamp_ttl(store: &dyn KvStore, ttl: Duration) -> Duration {
    ttl.clamp(MIN_TTL, store.max_ttl().max(MIN_TTL))
}

/// Read and deserialize a structured value. A value that no longer parses is treated as absent.
pub async fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> AppResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Discarding unreadable cache entry '{}': {}", key, e);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> AppResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| AppError::Store(e.to_string()))?;
    store.put(key, &raw, clamp_ttl(store, ttl)).await
}

/// Process-local store, used when no durable backend is configured
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}
