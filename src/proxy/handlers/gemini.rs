// Gemini Handler
// Request orchestration: auth -> project -> transform -> upstream -> response rewrite
use axum::{
    body::{Body, Bytes},
    extract::{OriginalUri, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::proxy::common::classify_error;
use crate::proxy::context::{Phase, RequestContext};
use crate::proxy::mappers::gemini::{
    build_upstream_request, create_json_stream, create_sse_stream, parse_model_path,
    unwrap_response, upstream_method, ModelPath, StreamCompletion,
};
use crate::proxy::server::AppState;
use crate::proxy::upstream::client::UpstreamResponse;

/// Logical name of the Code Assist circuit breaker
pub const UPSTREAM_BREAKER: &str = "code-assist";

/// A 401 from the model call clears the token cache and is retried this many times
const MAX_AUTH_RETRIES: u32 = 1;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Handle `POST /v1{beta}/models/{model}:{action}`
pub async fn handle_model_action(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(parsed) = parse_model_path(uri.path()) else {
        return AppError::InvalidPath(uri.path().to_string()).into_response();
    };

    if params.contains_key("key") {
        debug!("Dropping client API key, upstream uses OAuth");
    }
    let is_streaming = wants_stream(&params, &parsed.action);

    let mut ctx = RequestContext::new(&parsed.model, &parsed.action, is_streaming);
    state.metrics.record_start(is_streaming);
    debug!(
        "[{}] Received Gemini request: {}/{} (stream: {})",
        ctx.request_id, parsed.model, parsed.action, is_streaming
    );

    match process(&state, &mut ctx, &parsed, &body).await {
        Ok(upstream) => respond(&state, ctx, upstream).await,
        Err(e) => {
            let classification = classify_error(&e);
            ctx.finish(
                &state.metrics,
                classification.status_code,
                Some(&classification.message),
            );
            with_request_id(e.into_response(), &ctx.request_id)
        }
    }
}

/// `?stream` (anything but false/0) or an action name containing "stream"
fn wants_stream(params: &HashMap<String, String>, action: &str) -> bool {
    let flagged = params
        .get("stream")
        .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0"))
        .unwrap_or(false);
    flagged || action.to_ascii_lowercase().contains("stream")
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Drive one request to a successful upstream response
async fn process(
    state: &AppState,
    ctx: &mut RequestContext,
    parsed: &ModelPath,
    raw_body: &Bytes,
) -> AppResult<UpstreamResponse> {
    let body: Value = if raw_body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(raw_body)?
    };

    let mut auth_retries = 0;
    loop {
        // 1. Token + project
        ctx.start(Phase::Auth);
        let refreshes_before = state.token_manager.refresh_total();
        let access_token = state.token_manager.get_access_token().await?;
        let project_id = state.project_resolver.get_project_id().await?;
        ctx.cache_used = state.token_manager.refresh_total() == refreshes_before;
        ctx.end(Phase::Auth);

        // 2. Model + body
        ctx.start(Phase::Transform);
        let model = state.normalizer.normalize(&parsed.model);
        if model.changed {
            debug!("[{}] Model {} -> {}", ctx.request_id, parsed.model, model.normalized);
        }
        let upstream_body =
            build_upstream_request(&parsed.action, body.clone(), &model.normalized, &project_id);
        let (method, query) = upstream_method(&parsed.action, ctx.is_streaming);
        ctx.end(Phase::Transform);

        // 3. Upstream
        ctx.start(Phase::Upstream);
        let result = call_upstream(state, ctx, method, &access_token, &upstream_body, query).await;
        ctx.end(Phase::Upstream);
        let response = result?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED && auth_retries < MAX_AUTH_RETRIES {
            warn!(
                "[{}] Upstream rejected token (401), clearing cache and retrying",
                ctx.request_id
            );
            drop(response);
            state.token_manager.clear_token_cache().await;
            auth_retries += 1;
            ctx.retry_count += 1;
            continue;
        }
        if !status.is_success() {
            return Err(response.into_error().await);
        }
        return Ok(response);
    }
}

/// Retry (429 / 5xx / network) around the circuit breaker around the call.
/// Only 5xx and transport failures count against the breaker.
async fn call_upstream(
    state: &AppState,
    ctx: &mut RequestContext,
    method: &str,
    access_token: &str,
    body: &Value,
    query: Option<&str>,
) -> AppResult<UpstreamResponse> {
    let breaker = state.breakers.get(UPSTREAM_BREAKER);
    let upstream = &state.upstream;
    let mut last_attempt = 0;

    let result = state
        .retry
        .execute_with_rate_limit(|attempt| {
            last_attempt = attempt;
            let breaker = breaker.clone();
            async move {
                let response = breaker
                    .execute(|| async {
                        let response = upstream
                            .call_v1_internal(method, access_token, body, query)
                            .await?;
                        if response.status().is_server_error() {
                            return Err(response.into_error().await);
                        }
                        Ok::<_, AppError>(response)
                    })
                    .await?;

                if response.status() == StatusCode::TOO_MANY_REQUESTS {
                    return Err(response.into_error().await);
                }
                Ok::<_, AppError>(response)
            }
        })
        .await;

    ctx.retry_count += last_attempt;
    result
}

/// Turn a successful upstream response into the client response
async fn respond(state: &AppState, ctx: RequestContext, upstream: UpstreamResponse) -> Response {
    let request_id = ctx.request_id.clone();
    let metrics = state.metrics.clone();

    if ctx.is_streaming {
        let completion: StreamCompletion = Box::new(move |failure| {
            match failure {
                None => ctx.finish(&metrics, 200, None),
                Some(message) => ctx.finish(&metrics, 502, Some(&message)),
            };
        });
        let stream = create_sse_stream(upstream.bytes_stream(), completion);
        let mut response = Response::new(Body::from_stream(stream));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        return with_request_id(response, &request_id);
    }

    let small_enough = upstream
        .content_length()
        .is_some_and(|len| len <= state.config.large_body_threshold);

    if small_enough {
        let response = match upstream.bytes().await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    ctx.finish(&metrics, 200, None);
                    Json(unwrap_response(value)).into_response()
                }
                Err(e) => {
                    debug!("[{}] Upstream body is not JSON ({}), passing through", request_id, e);
                    ctx.finish(&metrics, 200, None);
                    json_body(Body::from(bytes))
                }
            },
            Err(e) => {
                let classification = classify_error(&e);
                ctx.finish(&metrics, classification.status_code, Some(&classification.message));
                e.into_response()
            }
        };
        return with_request_id(response, &request_id);
    }

    let completion: StreamCompletion = Box::new(move |failure| {
        match failure {
            None => ctx.finish(&metrics, 200, None),
            Some(message) => ctx.finish(&metrics, 502, Some(&message)),
        };
    });
    let stream = create_json_stream(upstream.bytes_stream(), completion);
    with_request_id(json_body(Body::from_stream(stream)), &request_id)
}

fn json_body(body: Body) -> Response {
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
