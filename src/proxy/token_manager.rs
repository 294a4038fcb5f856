// OAuth access token lifecycle
// memory -> durable store -> initial credential -> single-flight refresh

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

use crate::error::{AppError, AppResult};
use crate::modules::kv::{self, KvStore};
use crate::modules::oauth::{OAuthCredentials, TokenEndpoint};
use crate::proxy::common::utils::{generate_random_id, now_ms};
use crate::proxy::upstream::client::UpstreamClient;

/// 401 from an authenticated RPC is retried this many times after clearing the cache
const MAX_AUTH_RETRIES: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// A token is usable while `expiry_date - now > refresh_buffer_ms`
    pub refresh_buffer_ms: i64,
    /// An in-flight refresh older than this is abandoned
    pub refresh_stale_after_ms: i64,
    pub cache_key_prefix: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_ms: 5 * 60 * 1000,
            refresh_stale_after_ms: 30_000,
            cache_key_prefix: "gemini_oauth_token".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    /// Epoch ms at which the token stops working
    pub expiry_date: i64,
    pub refresh_count: u64,
    pub last_used: i64,
    pub created_at: i64,
    pub token_type: String,
    pub scope: String,
}

impl CachedToken {
    pub fn is_usable(&self, now: i64, buffer_ms: i64) -> bool {
        self.expiry_date - now > buffer_ms
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<CachedToken, String>>>;

struct RefreshOperation {
    id: String,
    future: RefreshFuture,
    started_at: i64,
}

pub struct TokenManager {
    credentials: OAuthCredentials,
    config: TokenConfig,
    cache_key: String,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn KvStore>,
    upstream: Arc<UpstreamClient>,
    cached: Arc<RwLock<Option<CachedToken>>>,
    refresh_op: Mutex<Option<RefreshOperation>>,
    /// Set once the initial credential has been considered; cleared by a failed refresh
    initialized: AtomicBool,
    refresh_total: Arc<AtomicU64>,
}

impl TokenManager {
    pub fn new(
        credentials: OAuthCredentials,
        config: TokenConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn KvStore>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        let cache_key = token_cache_key(&config.cache_key_prefix, &credentials.refresh_token);
        Self {
            credentials,
            config,
            cache_key,
            endpoint,
            store,
            upstream,
            cached: Arc::new(RwLock::new(None)),
            refresh_op: Mutex::new(None),
            initialized: AtomicBool::new(false),
            refresh_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    /// Total successful refreshes since startup
    pub fn refresh_total(&self) -> u64 {
        self.refresh_total.load(Ordering::Relaxed)
    }

    pub async fn cached_token(&self) -> Option<CachedToken> {
        self.cached.read().await.clone()
    }

    /// Get a usable access token, refreshing if required
    pub async fn get_access_token(&self) -> AppResult<String> {
        let now = now_ms();

        // 1. Memory
        if let Some(token) = self.touch_memory_token(now).await {
            return Ok(token.access_token);
        }

        // 2. Durable store
        match kv::get_json::<CachedToken>(self.store.as_ref(), &self.cache_key).await {
            Ok(Some(mut token)) if token.is_usable(now, self.config.refresh_buffer_ms) => {
                tracing::debug!(
                    "Adopted cached token from durable store (refresh #{})",
                    token.refresh_count
                );
                token.last_used = now;
                *self.cached.write().await = Some(token.clone());
                return Ok(token.access_token);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Token cache read failed, continuing without it: {}", e),
        }

        // 3. Initial credential
        if !self.initialized.swap(true, Ordering::SeqCst) {
            if let Some(token) = self.token_from_credentials(now) {
                tracing::info!("Using access token embedded in the OAuth credential");
                *self.cached.write().await = Some(token.clone());
                self.persist(&token, now).await;
                return Ok(token.access_token);
            }
        }

        // 4. Refresh
        let token = self.refresh_single_flight().await?;
        Ok(token.access_token)
    }

    async fn touch_memory_token(&self, now: i64) -> Option<CachedToken> {
        let mut guard = self.cached.write().await;
        match guard.as_mut() {
            Some(token) if token.is_usable(now, self.config.refresh_buffer_ms) => {
                token.last_used = now;
                Some(token.clone())
            }
            _ => None,
        }
    }

    fn token_from_credentials(&self, now: i64) -> Option<CachedToken> {
        let access_token = self.credentials.access_token.as_ref()?;
        let expiry_date = self.credentials.expiry_date?;
        if access_token.is_empty() || expiry_date - now <= self.config.refresh_buffer_ms {
            return None;
        }
        Some(CachedToken {
            access_token: access_token.clone(),
            expiry_date,
            refresh_count: 0,
            last_used: now,
            created_at: now,
            token_type: self
                .credentials
                .token_type
                .clone()
                .unwrap_or_else(|| "Bearer".to_string()),
            scope: self.credentials.scope.clone().unwrap_or_default(),
        })
    }

    async fn persist(&self, token: &CachedToken, now: i64) {
        let ttl = Duration::from_millis((token.expiry_date - now).max(0) as u64);
        if let Err(e) = kv::put_json(self.store.as_ref(), &self.cache_key, token, ttl).await {
            tracing::warn!("Token cache write failed: {}", e);
        }
    }

    /// Join the in-flight refresh if it is fresh, otherwise start a new one
    async fn refresh_single_flight(&self) -> AppResult<CachedToken> {
        let future = {
            let mut slot = self.refresh_op.lock().await;
            let now = now_ms();

            let in_flight = slot
                .as_ref()
                .filter(|op| now - op.started_at < self.config.refresh_stale_after_ms)
                .map(|op| (op.id.clone(), op.future.clone()));

            match in_flight {
                Some((id, future)) => {
                    tracing::debug!("Joining in-flight token refresh {}", id);
                    future
                }
                None => {
                    if let Some(stale) = slot.take() {
                        tracing::warn!(
                            "Discarding stale token refresh {} started {}ms ago",
                            stale.id,
                            now - stale.started_at
                        );
                    }
                    // A refresh may have completed while we waited for the slot
                    if let Some(token) = self.touch_memory_token(now).await {
                        return Ok(token);
                    }

                    let id = generate_random_id();
                    tracing::info!("Starting token refresh {}", id);
                    let future = self.start_refresh();
                    *slot = Some(RefreshOperation {
                        id,
                        future: future.clone(),
                        started_at: now,
                    });
                    future
                }
            }
        };

        let result = future.clone().await;

        {
            let mut slot = self.refresh_op.lock().await;
            if slot.as_ref().is_some_and(|op| op.future.ptr_eq(&future)) {
                *slot = None;
            }
        }

        result.map_err(|msg| {
            // Next caller starts over from the credential
            self.initialized.store(false, Ordering::SeqCst);
            tracing::error!("Token refresh failed: {}", msg);
            AppError::OAuth(msg)
        })
    }

    fn start_refresh(&self) -> RefreshFuture {
        let endpoint = self.endpoint.clone();
        let store = self.store.clone();
        let cached = self.cached.clone();
        let refresh_total = self.refresh_total.clone();
        let refresh_token = self.credentials.refresh_token.clone();
        let cache_key = self.cache_key.clone();

        async move {
            let in_memory = cached.read().await.as_ref().map(|t| t.refresh_count);
            let previous_count = match in_memory {
                Some(count) => count,
                None => match kv::get_json::<CachedToken>(store.as_ref(), &cache_key).await {
                    Ok(Some(t)) => t.refresh_count,
                    Ok(None) => 0,
                    Err(e) => {
                        tracing::warn!("Could not read refresh count from store: {}", e);
                        0
                    }
                },
            };

            let response = endpoint
                .refresh(&refresh_token)
                .await
                .map_err(|e| e.to_string())?;

            let now = now_ms();
            let token = CachedToken {
                access_token: response.access_token,
                expiry_date: now + response.expires_in * 1000,
                refresh_count: previous_count + 1,
                last_used: now,
                created_at: now,
                token_type: if response.token_type.is_empty() {
                    "Bearer".to_string()
                } else {
                    response.token_type
                },
                scope: response.scope.unwrap_or_default(),
            };

            *cached.write().await = Some(token.clone());
            refresh_total.fetch_add(1, Ordering::Relaxed);

            let ttl = Duration::from_millis((token.expiry_date - now).max(0) as u64);
            if let Err(e) = kv::put_json(store.as_ref(), &cache_key, &token, ttl).await {
                tracing::warn!("Token cache write failed: {}", e);
            }

            tracing::info!(
                "Token refreshed (refresh #{}), valid for {}s",
                token.refresh_count,
                response.expires_in
            );
            Ok(token)
        }
        .boxed()
        .shared()
    }

    /// Drop the token from memory and the durable store
    pub async fn clear_token_cache(&self) {
        *self.cached.write().await = None;
        if let Err(e) = self.store.delete(&self.cache_key).await {
            tracing::warn!("Token cache delete failed: {}", e);
        }
        tracing::info!("Token cache cleared");
    }

    /// Authenticated v1internal RPC. A 401 clears the token cache and is
    /// retried at most `MAX_AUTH_RETRIES` times; any other failure is final.
    pub async fn call_endpoint(&self, method: &str, body: &Value) -> AppResult<Value> {
        let mut attempt = 0;
        loop {
            let token = self.get_access_token().await?;
            let response = self
                .upstream
                .call_v1_internal(method, &token, body, None)
                .await?;
            let status = response.status();

            if status.is_success() {
                return response.json().await;
            }

            if status == StatusCode::UNAUTHORIZED && attempt < MAX_AUTH_RETRIES {
                tracing::warn!("{} returned 401, clearing token cache and retrying", method);
                drop(response);
                self.clear_token_cache().await;
                attempt += 1;
                continue;
            }

            return Err(response.into_error().await);
        }
    }
}

/// `<prefix>:<sha256(refresh_token)[..16]>`
fn token_cache_key(prefix: &str, refresh_token: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(refresh_token.as_bytes()));
    format!("{}:{}", prefix, &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::kv::MemoryKvStore;
    use crate::modules::oauth::TokenResponse;
    use crate::proxy::upstream::pool::{ConnectionPool, PoolConfig};
    use async_trait::async_trait;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockEndpoint {
        calls: AtomicUsize,
        delay_ms: u64,
        fail_first: usize,
        hang_first: bool,
    }

    #[async_trait]
    impl TokenEndpoint for MockEndpoint {
        async fn refresh(&self, _refresh_token: &str) -> AppResult<TokenResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang_first && n == 1 {
                futures::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if n <= self.fail_first {
                return Err(AppError::OAuth("invalid_grant".into()));
            }
            Ok(TokenResponse {
                access_token: format!("fresh-{}", n),
                expires_in: 3600,
                token_type: "Bearer".into(),
                scope: None,
                refresh_token: None,
            })
        }
    }

    impl MockEndpoint {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn upstream(base: &str) -> Arc<UpstreamClient> {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        Arc::new(UpstreamClient::new(base, None, pool).unwrap())
    }

    fn credentials(access_token: Option<&str>, expires_in_ms: i64) -> OAuthCredentials {
        OAuthCredentials {
            access_token: access_token.map(String::from),
            refresh_token: "1//refresh".into(),
            expiry_date: Some(now_ms() + expires_in_ms),
            ..Default::default()
        }
    }

    fn manager(
        creds: OAuthCredentials,
        endpoint: Arc<MockEndpoint>,
        store: Arc<MemoryKvStore>,
        base: &str,
    ) -> TokenManager {
        TokenManager::new(creds, TokenConfig::default(), endpoint, store, upstream(base))
    }

    #[tokio::test]
    async fn test_valid_token_is_reused_without_refresh() {
        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(
            credentials(Some("initial"), 10 * 60 * 1000),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            "http://127.0.0.1:9",
        );

        for _ in 0..5 {
            assert_eq!(tm.get_access_token().await.unwrap(), "initial");
        }
        assert_eq!(endpoint.calls(), 0);
        assert_eq!(tm.refresh_total(), 0);
    }

    #[tokio::test]
    async fn test_token_inside_buffer_is_refreshed() {
        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(
            credentials(Some("almost-expired"), 60 * 1000),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            "http://127.0.0.1:9",
        );
        assert_eq!(tm.get_access_token().await.unwrap(), "fresh-1");
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(MockEndpoint {
            delay_ms: 50,
            ..Default::default()
        });
        let tm = manager(
            credentials(None, 0),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            "http://127.0.0.1:9",
        );

        let results =
            futures::future::join_all((0..10).map(|_| tm.get_access_token())).await;
        for r in results {
            assert_eq!(r.unwrap(), "fresh-1");
        }
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(tm.refresh_total(), 1);
    }

    #[tokio::test]
    async fn test_durable_store_token_is_adopted() {
        let store = Arc::new(MemoryKvStore::new());
        let now = now_ms();
        let cached = CachedToken {
            access_token: "from-store".into(),
            expiry_date: now + 30 * 60 * 1000,
            refresh_count: 3,
            last_used: now - 1000,
            created_at: now - 5000,
            token_type: "Bearer".into(),
            scope: String::new(),
        };
        let key = token_cache_key("gemini_oauth_token", "1//refresh");
        kv::put_json(store.as_ref(), &key, &cached, Duration::from_secs(600))
            .await
            .unwrap();

        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(credentials(None, 0), endpoint.clone(), store, "http://127.0.0.1:9");
        assert_eq!(tm.get_access_token().await.unwrap(), "from-store");
        assert_eq!(endpoint.calls(), 0);

        let in_memory = tm.cached_token().await.unwrap();
        assert_eq!(in_memory.refresh_count, 3);
        assert!(in_memory.last_used >= now);
    }

    #[tokio::test]
    async fn test_refresh_count_survives_store_reconstruction() {
        let store = Arc::new(MemoryKvStore::new());
        let now = now_ms();
        let expired = CachedToken {
            access_token: "old".into(),
            expiry_date: now - 1,
            refresh_count: 4,
            last_used: now - 10_000,
            created_at: now - 3_600_000,
            token_type: "Bearer".into(),
            scope: String::new(),
        };
        let key = token_cache_key("gemini_oauth_token", "1//refresh");
        kv::put_json(store.as_ref(), &key, &expired, Duration::from_secs(600))
            .await
            .unwrap();

        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(credentials(None, 0), endpoint, store.clone(), "http://127.0.0.1:9");
        tm.get_access_token().await.unwrap();

        let stored: CachedToken = kv::get_json(store.as_ref(), &key).await.unwrap().unwrap();
        assert_eq!(stored.refresh_count, 5);
        assert_eq!(stored.access_token, "fresh-1");
        assert!(stored.expiry_date > now + 3_500_000);
    }

    #[tokio::test]
    async fn test_failed_refresh_propagates_and_next_call_retries() {
        let endpoint = Arc::new(MockEndpoint {
            fail_first: 1,
            ..Default::default()
        });
        let tm = manager(
            credentials(None, 0),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            "http://127.0.0.1:9",
        );

        assert!(matches!(tm.get_access_token().await, Err(AppError::OAuth(_))));
        assert!(!tm.initialized.load(Ordering::SeqCst));
        assert_eq!(tm.get_access_token().await.unwrap(), "fresh-2");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_refresh_is_discarded() {
        let endpoint = Arc::new(MockEndpoint {
            hang_first: true,
            ..Default::default()
        });
        let config = TokenConfig {
            refresh_stale_after_ms: 0,
            ..Default::default()
        };
        let tm = TokenManager::new(
            credentials(None, 0),
            config,
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            upstream("http://127.0.0.1:9"),
        );

        let hung = tokio::time::timeout(Duration::from_millis(50), tm.get_access_token()).await;
        assert!(hung.is_err());

        assert_eq!(tm.get_access_token().await.unwrap(), "fresh-2");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_token_cache_forces_refresh() {
        let endpoint = Arc::new(MockEndpoint::default());
        let store = Arc::new(MemoryKvStore::new());
        let tm = manager(
            credentials(Some("initial"), 60 * 60 * 1000),
            endpoint.clone(),
            store.clone(),
            "http://127.0.0.1:9",
        );
        assert_eq!(tm.get_access_token().await.unwrap(), "initial");
        assert_eq!(store.len(), 1);

        tm.clear_token_cache().await;
        assert!(store.is_empty());
        assert_eq!(tm.get_access_token().await.unwrap(), "fresh-1");
    }

    #[tokio::test]
    async fn test_call_endpoint_retries_once_on_401() {
        let server = MockServer::start_async().await;
        let rejected = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1internal:loadCodeAssist")
                    .header("authorization", "Bearer revoked");
                then.status(401).body("token revoked");
            })
            .await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1internal:loadCodeAssist")
                    .header("authorization", "Bearer fresh-1");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"cloudaicompanionProject":"p-1"}"#);
            })
            .await;

        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(
            credentials(Some("revoked"), 60 * 60 * 1000),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            &server.base_url(),
        );

        let body = tm.call_endpoint("loadCodeAssist", &json!({})).await.unwrap();
        assert_eq!(body["cloudaicompanionProject"], "p-1");
        rejected.assert_hits_async(1).await;
        accepted.assert_hits_async(1).await;
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_call_endpoint_gives_up_after_second_401() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1internal:loadCodeAssist");
                then.status(401).body("nope");
            })
            .await;

        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(
            credentials(Some("revoked"), 60 * 60 * 1000),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            &server.base_url(),
        );

        let err = tm.call_endpoint("loadCodeAssist", &json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream { status: 401, .. }));
        mock.assert_hits_async(2).await;
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_call_endpoint_other_status_is_terminal() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1internal:loadCodeAssist");
                then.status(500).body("backend error");
            })
            .await;

        let endpoint = Arc::new(MockEndpoint::default());
        let tm = manager(
            credentials(Some("valid"), 60 * 60 * 1000),
            endpoint.clone(),
            Arc::new(MemoryKvStore::new()),
            &server.base_url(),
        );

        let err = tm.call_endpoint("loadCodeAssist", &json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream { status: 500, .. }));
        mock.assert_hits_async(1).await;
        assert_eq!(endpoint.calls(), 0);
    }

    #[test]
    fn test_cache_key_depends_on_refresh_token() {
        let a = token_cache_key("p", "one");
        let b = token_cache_key("p", "two");
        assert!(a.starts_with("p:"));
        assert_eq!(a.len(), 2 + 16);
        assert_ne!(a, b);
    }
}
