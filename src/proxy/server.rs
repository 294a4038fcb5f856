use axum::{
    extract::{DefaultBodyLimit, OriginalUri, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::{AppError, AppResult};
use crate::modules::kv::KvStore;
use crate::modules::oauth::{OAuthCredentials, TokenEndpoint};
use crate::proxy::common::{CircuitBreakerRegistry, ModelNormalizer, RetryManager};
use crate::proxy::config::ProxyConfig;
use crate::proxy::context::ProxyMetrics;
use crate::proxy::project_resolver::{ProjectResolver, ValidationOutcome};
use crate::proxy::upstream::client::UpstreamClient;
use crate::proxy::upstream::pool::ConnectionPool;
use crate::proxy::TokenManager;

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub token_manager: Arc<TokenManager>,
    pub project_resolver: Arc<ProjectResolver>,
    pub upstream: Arc<UpstreamClient>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryManager>,
    pub normalizer: Arc<ModelNormalizer>,
    pub metrics: Arc<ProxyMetrics>,
}

impl AppState {
    /// Wire every core component once; handlers only ever see these instances
    pub fn new(
        config: ProxyConfig,
        credentials: OAuthCredentials,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn KvStore>,
    ) -> AppResult<Self> {
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let upstream = Arc::new(UpstreamClient::new(
            config.upstream_base_url.clone(),
            Some(config.upstream_proxy.clone()),
            pool,
        )?);
        let token_manager = Arc::new(TokenManager::new(
            credentials,
            config.token.clone(),
            endpoint,
            store.clone(),
            upstream.clone(),
        ));
        let retry = Arc::new(RetryManager::new(config.retry.clone()));
        let project_resolver = Arc::new(
            ProjectResolver::new(config.project.clone(), token_manager.clone(), store)
                .with_retry(retry.clone()),
        );

        Ok(Self {
            token_manager,
            project_resolver,
            upstream,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            retry,
            normalizer: Arc::new(ModelNormalizer::new(config.model_mapping.clone())),
            metrics: Arc::new(ProxyMetrics::new()),
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    use crate::proxy::handlers;

    Router::new()
        // Gemini Protocol (Native); `model:action` is one path segment
        .route(
            "/v1/models/:model_action",
            post(handlers::gemini::handle_model_action),
        )
        .route(
            "/v1beta/models/:model_action",
            post(handlers::gemini::handle_model_action),
        )
        .route("/healthz", get(health_check_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Axum server instance
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: SocketAddr,
    background: Vec<JoinHandle<()>>,
}

impl AxumServer {
    /// Start Axum server
    pub async fn start(
        host: &str,
        port: u16,
        state: AppState,
    ) -> Result<(Self, JoinHandle<()>), String> {
        let background = spawn_background_tasks(&state);
        let app = build_router(state);

        // Bind address
        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        tracing::info!("Reverse proxy server started at http://{}", local_addr);

        // Create shutdown channel
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let server_instance = Self {
            shutdown_tx: Some(shutdown_tx),
            local_addr,
            background,
        };

        // Start server in new task
        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!(
                                            "Connection handling finished or errored: {:?}",
                                            err
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Reverse proxy server stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((server_instance, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop server
    pub fn stop(mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Project revalidation and connection descriptor cleanup
fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let resolver = state.project_resolver.clone();
    // validate_cached_project_id skips entries checked within the interval,
    // so ticking more often only bounds how late a due check can run
    let validate_every = Duration::from_millis(
        state
            .config
            .project
            .validation_interval_ms
            .clamp(60_000, 60 * 60 * 1000) as u64,
    );
    let validator = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(validate_every);
        ticker.tick().await; // first tick completes immediately
        loop {
            ticker.tick().await;
            match resolver.validate_cached_project_id().await {
                ValidationOutcome::Skipped => {}
                outcome => debug!("Project validation: {:?}", outcome),
            }
        }
    });

    let pool = state.upstream.pool().clone();
    let cleanup_every = Duration::from_millis(state.config.pool.max_idle_time_ms.max(1_000));
    let janitor = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_every);
        loop {
            ticker.tick().await;
            pool.cleanup();
        }
    });

    vec![validator, janitor]
}

/// Health check handler
async fn health_check_handler(State(state): State<AppState>) -> Response {
    let token = state.token_manager.cached_token().await.map(|t| {
        serde_json::json!({
            "expiry_date": t.expiry_date,
            "refresh_count": t.refresh_count,
            "last_used": t.last_used,
        })
    });
    let project = state.project_resolver.cached().await.map(|p| {
        serde_json::json!({
            "project_id": p.project_id,
            "source": p.source,
            "validation_count": p.validation_count,
        })
    });

    Json(serde_json::json!({
        "status": "ok",
        "metrics": state.metrics.snapshot(state.token_manager.refresh_total()),
        "circuit_breakers": state.breakers.snapshots(),
        "pool": state.upstream.pool().stats(),
        "token": token,
        "project": project,
    }))
    .into_response()
}

async fn not_found_handler(OriginalUri(uri): OriginalUri) -> Response {
    AppError::InvalidPath(uri.path().to_string()).into_response()
}
