// Error classification
// Maps raw failures (status / error / message text) to a retry + cache decision

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    ClientError,
    AuthError,
    UpstreamError,
    SystemError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ClientError => "CLIENT_ERROR",
            ErrorType::AuthError => "AUTH_ERROR",
            ErrorType::UpstreamError => "UPSTREAM_ERROR",
            ErrorType::SystemError => "SYSTEM_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorClassification {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub status_code: u16,
    /// Sanitized, safe to log and return
    pub message: String,
    pub is_retryable: bool,
    pub should_clear_cache: bool,
}

static BEARER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*").expect("valid regex"));

// key=value, key: value, "key": "value" and JSON-escaped \"key\": \"value\" forms.
// Quoted values are consumed up to their closing quote, spaces included.
static SECRET_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"(?i)(\\?"?[A-Za-z_]*(?:key|secret|password|authorization|token)\\?"?\s*[:=]\s*)"#,
        r#"(?:\\"(?:[^\\]|\\[^"])*\\"|"(?:[^"\\]|\\.)*"|[^\s",&}]+)"#,
    ))
    .expect("valid regex")
});

/// Redact bearer tokens and credential-like fields
pub fn sanitize_message(message: &str) -> String {
    let redacted = BEARER_RE.replace_all(message, "Bearer [REDACTED]");
    SECRET_FIELD_RE
        .replace_all(&redacted, "${1}[REDACTED]")
        .into_owned()
}

/// Status-code-first classification
pub fn classify_status(status: u16, message: &str) -> ErrorClassification {
    let message = sanitize_message(message);
    let (error_type, is_retryable, should_clear_cache) = match status {
        401 => (ErrorType::AuthError, true, true),
        429 => (ErrorType::ClientError, true, false),
        400..=499 => (ErrorType::ClientError, false, false),
        500..=599 => (ErrorType::UpstreamError, true, false),
        _ => (ErrorType::SystemError, false, false),
    };
    let status_code = if error_type == ErrorType::SystemError {
        500
    } else {
        status
    };
    ErrorClassification {
        error_type,
        status_code,
        message,
        is_retryable,
        should_clear_cache,
    }
}

/// Fallback when no status is available
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    let message = sanitize_message(message);

    if lower.contains("token") || lower.contains("auth") {
        return ErrorClassification {
            error_type: ErrorType::AuthError,
            status_code: 401,
            message,
            is_retryable: true,
            should_clear_cache: true,
        };
    }
    if lower.contains("network") || lower.contains("timeout") {
        return ErrorClassification {
            error_type: ErrorType::UpstreamError,
            status_code: 502,
            message,
            is_retryable: true,
            should_clear_cache: false,
        };
    }
    if lower.contains("invalid") || lower.contains("malformed") {
        return ErrorClassification {
            error_type: ErrorType::ClientError,
            status_code: 400,
            message,
            is_retryable: false,
            should_clear_cache: false,
        };
    }
    ErrorClassification {
        error_type: ErrorType::SystemError,
        status_code: 500,
        message,
        is_retryable: false,
        should_clear_cache: false,
    }
}

/// Classify a crate error
pub fn classify_error(err: &AppError) -> ErrorClassification {
    match err {
        AppError::Upstream { status, body, .. } => classify_status(*status, body),
        AppError::Network(e) => match e.status() {
            Some(status) => classify_status(status.as_u16(), &e.to_string()),
            None => ErrorClassification {
                error_type: ErrorType::UpstreamError,
                status_code: if e.is_timeout() { 504 } else { 502 },
                message: sanitize_message(&format!("Network error: {}", e)),
                is_retryable: true,
                should_clear_cache: false,
            },
        },
        AppError::CircuitOpen(name) => ErrorClassification {
            error_type: ErrorType::UpstreamError,
            status_code: 503,
            message: format!("Upstream '{}' temporarily unavailable", name),
            is_retryable: false,
            should_clear_cache: false,
        },
        AppError::OAuth(msg) => ErrorClassification {
            error_type: ErrorType::AuthError,
            status_code: 401,
            message: sanitize_message(msg),
            is_retryable: true,
            should_clear_cache: true,
        },
        AppError::InvalidPath(path) => ErrorClassification {
            error_type: ErrorType::ClientError,
            status_code: 404,
            message: format!("Unsupported path: {}", sanitize_message(path)),
            is_retryable: false,
            should_clear_cache: false,
        },
        AppError::Transform(msg) => ErrorClassification {
            error_type: ErrorType::ClientError,
            status_code: 400,
            message: sanitize_message(msg),
            is_retryable: false,
            should_clear_cache: false,
        },
        AppError::Json(e) => ErrorClassification {
            error_type: ErrorType::ClientError,
            status_code: 400,
            message: format!("Malformed JSON: {}", e),
            is_retryable: false,
            should_clear_cache: false,
        },
        AppError::Project(msg) => ErrorClassification {
            error_type: ErrorType::SystemError,
            status_code: 500,
            message: sanitize_message(msg),
            is_retryable: false,
            should_clear_cache: false,
        },
        other => classify_message(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_rules() {
        let auth = classify_status(401, "unauthorized");
        assert_eq!(auth.error_type, ErrorType::AuthError);
        assert!(auth.is_retryable && auth.should_clear_cache);

        let limited = classify_status(429, "slow down");
        assert_eq!(limited.error_type, ErrorType::ClientError);
        assert!(limited.is_retryable);

        let not_found = classify_status(404, "missing");
        assert_eq!(not_found.error_type, ErrorType::ClientError);
        assert!(!not_found.is_retryable);

        let upstream = classify_status(503, "unavailable");
        assert_eq!(upstream.error_type, ErrorType::UpstreamError);
        assert!(upstream.is_retryable);

        let weird = classify_status(302, "redirect");
        assert_eq!(weird.error_type, ErrorType::SystemError);
        assert!(!weird.is_retryable);
    }

    #[test]
    fn test_message_fallback() {
        assert_eq!(
            classify_message("Token expired").error_type,
            ErrorType::AuthError
        );
        assert_eq!(
            classify_message("network unreachable").error_type,
            ErrorType::UpstreamError
        );
        assert_eq!(
            classify_message("request timeout").error_type,
            ErrorType::UpstreamError
        );
        assert_eq!(
            classify_message("malformed body").error_type,
            ErrorType::ClientError
        );
        assert_eq!(
            classify_message("something odd").error_type,
            ErrorType::SystemError
        );
    }

    #[test]
    fn test_sanitize_redacts_credentials() {
        let raw = concat!(
            r#"Authorization: Bearer ya29.a0AfH6SMBxyz failed, "#,
            r#"{"client_secret": "GOCSPX-abc", "api_key":"AIzaSy123"} password=hunter2"#,
        );
        let clean = sanitize_message(raw);
        assert!(!clean.contains("ya29"));
        assert!(!clean.contains("GOCSPX-abc"));
        assert!(!clean.contains("AIzaSy123"));
        assert!(!clean.contains("hunter2"));
        assert!(clean.contains("[REDACTED]"));
    }

    #[test]
    fn test_sanitize_quoted_value_with_spaces() {
        let clean = sanitize_message(r#"{"client_secret": "GOCSPX abc def", "model": "m"}"#);
        assert_eq!(clean, r#"{"client_secret": [REDACTED], "model": "m"}"#);
    }

    #[test]
    fn test_sanitize_json_escaped_fields() {
        // upstream error text that embeds a serialized request
        let raw = concat!(
            r#"{"error":{"message":"bad body {\"access_token\": \"ya29.leak\", "#,
            r#"\"refresh_token\":\"1//x y\"}"}}"#,
        );
        let clean = sanitize_message(raw);
        assert!(!clean.contains("ya29.leak"));
        assert!(!clean.contains("1//x"));
        assert!(clean.contains(r#"\"access_token\": [REDACTED]"#));
        assert!(clean.ends_with(r#"}"}}"#));
    }

    #[test]
    fn test_sanitize_keeps_plain_text() {
        assert_eq!(sanitize_message("model not found"), "model not found");
    }

    #[test]
    fn test_classify_app_errors() {
        let err = AppError::Upstream {
            status: 429,
            body: "quota".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(classify_error(&err).status_code, 429);

        let open = classify_error(&AppError::CircuitOpen("code-assist".into()));
        assert_eq!(open.status_code, 503);
        assert!(!open.is_retryable);

        let unknown = classify_error(&AppError::Unknown("boom".into()));
        assert_eq!(unknown.error_type, ErrorType::SystemError);
    }
}
