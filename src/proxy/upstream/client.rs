// Upstream client implementation
// Code Assist v1internal RPC: `{base}/{api_version}:{method}`

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Duration;

use super::pool::{ConnectionLease, ConnectionPool};
use crate::error::{AppError, AppResult};
use crate::proxy::common::retry::parse_retry_after;
use crate::proxy::config::UpstreamProxyConfig;

// Production environment endpoint
pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const CODE_ASSIST_API_VERSION: &str = "v1internal";

const USER_AGENT: &str = concat!("gemini-oauth-proxy/", env!("CARGO_PKG_VERSION"));
const API_CLIENT: &str = concat!("gl-rust/gemini-oauth-proxy-", env!("CARGO_PKG_VERSION"));

pub struct UpstreamClient {
    http_client: Client,
    base_url: String,
    api_version: String,
    pool: Arc<ConnectionPool>,
}

impl UpstreamClient {
    pub fn new(
        base_url: impl Into<String>,
        proxy_config: Option<UpstreamProxyConfig>,
        pool: Arc<ConnectionPool>,
    ) -> AppResult<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(600))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(USER_AGENT);

        if let Some(config) = proxy_config {
            if config.enabled && !config.url.is_empty() {
                let proxy = reqwest::Proxy::all(&config.url).map_err(|e| {
                    AppError::Config(format!("Invalid upstream proxy {}: {}", config.url, e))
                })?;
                builder = builder.proxy(proxy);
                tracing::info!("UpstreamClient enabled proxy: {}", config.url);
            }
        }

        Ok(Self {
            http_client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: CODE_ASSIST_API_VERSION.to_string(),
            pool,
        })
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Build v1internal URL
    fn build_url(&self, method: &str, query_string: Option<&str>) -> String {
        match query_string {
            Some(qs) => format!("{}/{}:{}?{}", self.base_url, self.api_version, method, qs),
            None => format!("{}/{}:{}", self.base_url, self.api_version, method),
        }
    }

    /// Call v1internal API. Any HTTP status is returned as a response;
    /// only transport failures are errors.
    pub async fn call_v1_internal(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
    ) -> AppResult<UpstreamResponse> {
        let url = self.build_url(method, query_string);
        let lease = self.pool.acquire(&url)?;
        let hints = self.pool.request_hints();

        // Build Headers
        let mut headers = hints.headers;
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|_| AppError::OAuth("Access token is not a valid header value".into()))?,
        );
        headers.insert("x-goog-api-client", header::HeaderValue::from_static(API_CLIENT));

        tracing::debug!("Upstream call {} via {}", method, lease.host_key());

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .timeout(hints.timeout)
            .json(body)
            .send()
            .await?;

        Ok(UpstreamResponse {
            inner: response,
            lease,
        })
    }
}

/// Upstream response that keeps its connection descriptor in use until consumed
pub struct UpstreamResponse {
    inner: Response,
    lease: ConnectionLease,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.inner
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
    }

    pub async fn bytes(self) -> AppResult<Bytes> {
        let bytes = self.inner.bytes().await?;
        drop(self.lease);
        Ok(bytes)
    }

    pub async fn json(self) -> AppResult<Value> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Consume a non-success response into an `AppError::Upstream`
    pub async fn into_error(self) -> AppError {
        let status = self.status().as_u16();
        let retry_after = self.retry_after();
        let body = match self.inner.text().await {
            Ok(text) => text,
            Err(e) => format!("<unreadable body: {}>", e),
        };
        AppError::Upstream {
            status,
            body,
            retry_after,
        }
    }

    /// Body as a byte stream; the descriptor is released when the stream is dropped
    pub fn bytes_stream(
        self,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static {
        let lease = self.lease;
        self.inner.bytes_stream().map(move |chunk| {
            let _held = &lease;
            chunk
        })
    }
}
