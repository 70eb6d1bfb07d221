//! OAuth token refresh against the identity provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::CredentialConfig;

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

#[derive(Debug, Clone, Error)]
pub enum RefreshFailure {
    #[error("{code}{}", .description.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    Rejected {
        status: Option<u16>,
        code: String,
        description: Option<String>,
    },

    #[error("Token endpoint unreachable: {0}")]
    Transport(String),
}

impl RefreshFailure {
    /// The refresh token is dead (revoked or expired); the user has to reconnect.
    pub fn requires_reauth(&self) -> bool {
        match self {
            RefreshFailure::Rejected {
                code, description, ..
            } => {
                let code = code.to_ascii_lowercase();
                let description = description.as_deref().unwrap_or_default().to_ascii_lowercase();
                code == "invalid_grant"
                    || description.contains("invalid_grant")
                    || description.contains("revoked")
            }
            RefreshFailure::Transport(_) => false,
        }
    }
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshFailure>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// `grant_type=refresh_token` client for the configured token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthRefresher {
    pub fn new(config: &CredentialConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshFailure> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        if !status.is_success() {
            let parsed: Option<TokenErrorResponse> = serde_json::from_slice(&body).ok();
            let (code, description) = match parsed {
                Some(err) => (err.error, err.error_description),
                None => (None, None),
            };
            return Err(RefreshFailure::Rejected {
                status: Some(status.as_u16()),
                code: code.unwrap_or_else(|| format!("http_{}", status.as_u16())),
                description,
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| RefreshFailure::Rejected {
                status: Some(status.as_u16()),
                code: "invalid_response".into(),
                description: Some(e.to_string()),
            })?;

        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: Duration::from_secs(token.expires_in.unwrap_or(3600)),
        })
    }
}
