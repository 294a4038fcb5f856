use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

use crate::error::{AppError, AppResult};
use crate::modules::kv::{self, KvStore};
use crate::proxy::common::utils::now_ms;
use crate::proxy::common::RetryManager;
use crate::proxy::token_manager::TokenManager;

/// Identifier sent to loadCodeAssist before the real project is known
const PLACEHOLDER_PROJECT: &str = "default-project";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Explicit project id, always wins over discovery
    pub project_id: Option<String>,
    pub cache_ttl_ms: i64,
    pub validation_interval_ms: i64,
    pub cache_key: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            cache_ttl_ms: 60 * 60 * 1000,
            validation_interval_ms: 24 * 60 * 60 * 1000,
            cache_key: "gemini_project_id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectSource {
    Environment,
    Discovery,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCache {
    pub project_id: String,
    pub discovered_at: i64,
    /// Epoch ms after which the entry is no longer fresh
    pub expires_at: i64,
    pub source: ProjectSource,
    pub validation_count: u32,
    #[serde(default)]
    pub last_validated: i64,
}

impl ProjectCache {
    fn new(project_id: String, source: ProjectSource, now: i64, ttl_ms: i64) -> Self {
        Self {
            project_id,
            discovered_at: now,
            expires_at: now.saturating_add(ttl_ms),
            source,
            validation_count: 0,
            last_validated: now,
        }
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Nothing to validate, or validated recently
    Skipped,
    Confirmed,
    /// Upstream now reports a different project; the cache was cleared
    Mismatch { cached: String, discovered: String },
    Failed(String),
}

pub struct ProjectResolver {
    config: ProjectConfig,
    token_manager: Arc<TokenManager>,
    store: Arc<dyn KvStore>,
    retry: Option<Arc<RetryManager>>,
    cache: RwLock<Option<ProjectCache>>,
    discovery_lock: Mutex<()>,
}

impl ProjectResolver {
    pub fn new(
        config: ProjectConfig,
        token_manager: Arc<TokenManager>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            token_manager,
            store,
            retry: None,
            cache: RwLock::new(None),
            discovery_lock: Mutex::new(()),
        }
    }

    /// Back off and retry discovery on 5xx and network failures
    pub fn with_retry(mut self, retry: Arc<RetryManager>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub async fn cached(&self) -> Option<ProjectCache> {
        self.cache.read().await.clone()
    }

    fn explicit_project(&self) -> Option<&str> {
        self.config
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Durable copies outlive their freshness so they can serve as a fallback
    fn store_retention(&self) -> Duration {
        let ms = self
            .config
            .cache_ttl_ms
            .max(self.config.validation_interval_ms)
            .max(0);
        Duration::from_millis(ms as u64)
    }

    pub async fn get_project_id(&self) -> AppResult<String> {
        let now = now_ms();

        if let Some(id) = self.explicit_project() {
            let mut guard = self.cache.write().await;
            let current = guard
                .as_ref()
                .is_some_and(|c| c.source == ProjectSource::Environment && c.project_id == id);
            if !current {
                tracing::info!("Using configured project id {}", id);
                *guard = Some(ProjectCache::new(
                    id.to_string(),
                    ProjectSource::Environment,
                    now,
                    i64::MAX,
                ));
            }
            return Ok(id.to_string());
        }

        if let Some(id) = self.fresh_memory(now).await {
            return Ok(id);
        }

        // One discovery at a time; later callers pick up its result
        let _discovery = self.discovery_lock.lock().await;
        if let Some(id) = self.fresh_memory(now_ms()).await {
            return Ok(id);
        }

        let stored = match kv::get_json::<ProjectCache>(self.store.as_ref(), &self.config.cache_key)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Project cache read failed, continuing without it: {}", e);
                None
            }
        };

        if let Some(mut entry) = stored.clone().filter(|e| e.is_fresh(now)) {
            tracing::debug!("Promoted project id {} from durable store", entry.project_id);
            entry.source = ProjectSource::Cache;
            let id = entry.project_id.clone();
            *self.cache.write().await = Some(entry);
            return Ok(id);
        }

        match self.discover().await {
            Ok(id) => {
                tracing::info!("Discovered project id {}", id);
                let entry = ProjectCache::new(
                    id.clone(),
                    ProjectSource::Discovery,
                    now_ms(),
                    self.config.cache_ttl_ms,
                );
                self.persist(&entry).await;
                *self.cache.write().await = Some(entry);
                Ok(id)
            }
            Err(e) => {
                let fallback = match self.cache.read().await.as_ref() {
                    Some(entry) => Some(entry.project_id.clone()),
                    None => stored.map(|entry| entry.project_id),
                };
                match fallback {
                    Some(id) => {
                        tracing::warn!(
                            "Project discovery failed ({}), falling back to stale project id {}",
                            e,
                            id
                        );
                        Ok(id)
                    }
                    None => Err(AppError::Project(format!("Project discovery failed: {}", e))),
                }
            }
        }
    }

    async fn fresh_memory(&self, now: i64) -> Option<String> {
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_fresh(now))
            .map(|c| c.project_id.clone())
    }

    async fn persist(&self, entry: &ProjectCache) {
        let retention = self.store_retention();
        if let Err(e) =
            kv::put_json(self.store.as_ref(), &self.config.cache_key, entry, retention).await
        {
            tracing::warn!("Project cache write failed: {}", e);
        }
    }

    async fn discover(&self) -> AppResult<String> {
        match &self.retry {
            Some(retry) => retry.execute(|_| self.discover_once()).await,
            None => self.discover_once().await,
        }
    }

    async fn discover_once(&self) -> AppResult<String> {
        let body = json!({
            "cloudaicompanionProject": PLACEHOLDER_PROJECT,
            "metadata": {
                "ideType": "IDE_UNSPECIFIED",
                "platform": "PLATFORM_UNSPECIFIED",
                "pluginType": "GEMINI",
                "duetProject": PLACEHOLDER_PROJECT,
            }
        });
        let response = self.token_manager.call_endpoint("loadCodeAssist", &body).await?;
        extract_project_id(&response).ok_or_else(|| {
            AppError::Project("loadCodeAssist response has no cloudaicompanionProject".to_string())
        })
    }

    /// Re-run discovery for a cached id; a different answer clears the cache.
    /// Failures are logged and never surface to the request path.
    pub async fn validate_cached_project_id(&self) -> ValidationOutcome {
        if self.explicit_project().is_some() {
            return ValidationOutcome::Skipped;
        }
        let Some(entry) = self.cached().await else {
            return ValidationOutcome::Skipped;
        };
        let now = now_ms();
        let last_checked = entry.discovered_at.max(entry.last_validated);
        if now - last_checked < self.config.validation_interval_ms {
            return ValidationOutcome::Skipped;
        }

        match self.discover().await {
            Ok(discovered) if discovered == entry.project_id => {
                let mut updated = entry;
                updated.validation_count += 1;
                updated.last_validated = now;
                updated.expires_at = now.saturating_add(self.config.cache_ttl_ms);
                self.persist(&updated).await;
                tracing::debug!(
                    "Project id {} confirmed ({} validations)",
                    updated.project_id,
                    updated.validation_count
                );
                *self.cache.write().await = Some(updated);
                ValidationOutcome::Confirmed
            }
            Ok(discovered) => {
                tracing::warn!(
                    "Cached project id {} no longer matches upstream ({}), clearing cache",
                    entry.project_id,
                    discovered
                );
                self.clear_cache().await;
                ValidationOutcome::Mismatch {
                    cached: entry.project_id,
                    discovered,
                }
            }
            Err(e) => {
                tracing::warn!("Project id validation failed: {}", e);
                ValidationOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
        if let Err(e) = self.store.delete(&self.config.cache_key).await {
            tracing::warn!("Project cache delete failed: {}", e);
        }
    }
}

/// `cloudaicompanionProject` is either a bare id or `{ "id": ... }`
fn extract_project_id(response: &Value) -> Option<String> {
    match response.get("cloudaicompanionProject")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(String::from),
        _ => None,
    }
}
