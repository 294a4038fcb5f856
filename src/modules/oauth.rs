use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::proxy::common::sanitize_message;

// Google OAuth Configuration
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Initial OAuth credential (the `oauth_creds.json` shape)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    pub refresh_token: String,
    /// Epoch milliseconds
    #[serde(default)]
    pub expiry_date: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl OAuthCredentials {
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read credentials {:?}: {}", path, e))
        })?;
        let creds: Self = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse credentials: {}", e)))?;
        if creds.refresh_token.trim().is_empty() {
            return Err(AppError::Config(
                "Credentials are missing refresh_token".to_string(),
            ));
        }
        Ok(creds)
    }
}

/// OAuth2 token endpoint, the network half of a refresh
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> AppResult<TokenResponse>;
}

pub struct GoogleTokenEndpoint {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl GoogleTokenEndpoint {
    pub fn new(client: Client, client_id: String, client_secret: String) -> Self {
        Self::with_url(client, TOKEN_URL.to_string(), client_id, client_secret)
    }

    pub fn with_url(
        client: Client,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenEndpoint for GoogleTokenEndpoint {
    /// Refresh access_token using refresh_token
    async fn refresh(&self, refresh_token: &str) -> AppResult<TokenResponse> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::OAuth(format!("Refresh request failed: {}", e)))?;

        if response.status().is_success() {
            let token_data = response
                .json::<TokenResponse>()
                .await
                .map_err(|e| AppError::OAuth(format!("Refresh data parsing failed: {}", e)))?;

            tracing::info!(
                "Token refresh successful! Expires in: {} seconds",
                token_data.expires_in
            );
            Ok(token_data)
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            Err(AppError::OAuth(format!(
                "Refresh failed ({}): {}",
                status,
                sanitize_message(&error_text)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[test]
    fn test_load_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"access_token":"ya29.x","refresh_token":"1//r","#,
                r#""expiry_date":1700000000000,"token_type":"Bearer"}"#,
            ),
        )
        .unwrap();
        let creds = OAuthCredentials::load(&path).unwrap();
        assert_eq!(creds.refresh_token, "1//r");
        assert_eq!(creds.expiry_date, Some(1_700_000_000_000));
        assert!(creds.client_id.is_none());
    }

    #[test]
    fn test_load_rejects_missing_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        std::fs::write(&path, r#"{"refresh_token":"  "}"#).unwrap();
        assert!(matches!(
            OAuthCredentials::load(&path),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_posts_form() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_includes("grant_type=refresh_token")
                    .body_includes("refresh_token=r-1")
                    .body_includes("client_id=cid");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        r#"{"access_token":"new-token","expires_in":3599,"token_type":"Bearer"}"#,
                    );
            })
            .await;

        let endpoint = GoogleTokenEndpoint::with_url(
            Client::new(),
            server.url("/token"),
            "cid".into(),
            "secret".into(),
        );
        let token = endpoint.refresh("r-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(token.access_token, "new-token");
        assert_eq!(token.expires_in, 3599);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_oauth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(400).body(r#"{"error":"invalid_grant"}"#);
            })
            .await;

        let endpoint = GoogleTokenEndpoint::with_url(
            Client::new(),
            server.url("/token"),
            "cid".into(),
            "secret".into(),
        );
        let err = endpoint.refresh("r-1").await.unwrap_err();
        assert!(matches!(err, AppError::OAuth(msg) if msg.contains("invalid_grant")));
    }
}
