use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::proxy::common::error_classifier::{classify_error, ErrorType};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-2xx response from an upstream service
    #[error("Upstream returned {status}: {body}")]
    Upstream {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Project resolution failed: {0}")]
    Project(String),

    #[error("Invalid request path: {0}")]
    InvalidPath(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Upstream { status, .. } => Some(*status),
            AppError::Network(e) => e.status().map(|s| s.as_u16()),
            AppError::InvalidPath(_) => Some(404),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// Implement alias for Result to simplify usage
pub type AppResult<T> = Result<T, AppError>;

/// Google API status name for an HTTP code
pub fn google_status(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "ABORTED",
        429 => "RESOURCE_EXHAUSTED",
        499 => "CANCELLED",
        501 => "UNIMPLEMENTED",
        502 | 503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        400..=499 => "FAILED_PRECONDITION",
        _ => "INTERNAL",
    }
}

/// `{"error": {"code", "message", "status"}}`, sanitized
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let classification = classify_error(&self);
        let status = StatusCode::from_u16(classification.status_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = if classification.error_type == ErrorType::SystemError {
            tracing::error!("Internal error: {}", classification.message);
            "Internal server error".to_string()
        } else {
            classification.message
        };

        let body = Json(json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": google_status(status.as_u16()),
            }
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(wait) = self.retry_after() {
                let secs = wait.as_secs_f64().ceil() as u64;
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
        }
        response
    }
}
