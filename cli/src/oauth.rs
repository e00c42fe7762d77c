//! Network half of the OAuth flow: code exchange and token refresh.

use anyhow::{Context, Result};
use serde::Serialize;

use nutrilog_core::config::OAuthConfig;
use nutrilog_core::error::StorageError;
use nutrilog_core::models::now_millis;
use nutrilog_core::oauth::{ExchangeRequest, RefreshRequest, StoredToken, TokenResponse};

const BODY_SNIPPET: usize = 256;

#[derive(Clone)]
pub struct TokenClient {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl TokenClient {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    /// Trade an authorization code for a session.
    pub async fn exchange(&self, code: &str, verifier: &str) -> Result<StoredToken, StorageError> {
        let body = ExchangeRequest {
            code: code.trim(),
            code_verifier: verifier,
            redirect_uri: &self.config.redirect_uri,
            client_id: &self.config.client_id,
        };
        self.post_token(&self.config.exchange_url, &body, None).await
    }

    /// Mint a fresh access token for an existing session.
    pub async fn refresh(&self, user_id: &str) -> Result<StoredToken, StorageError> {
        let body = RefreshRequest { user_id };
        self.post_token(&self.config.refresh_url, &body, Some(user_id))
            .await
    }

    async fn post_token<B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
        previous_user_id: Option<&str>,
    ) -> Result<StoredToken, StorageError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("token endpoint unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(BODY_SNIPPET).collect();
            return Err(match status.as_u16() {
                400 | 401 | 403 => {
                    StorageError::Unauthorized(format!("token request rejected ({status}): {snippet}"))
                }
                _ => StorageError::Transient(format!("token endpoint returned {status}: {snippet}")),
            });
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Transient(format!("malformed token response: {e}")))?;
        StoredToken::from_response(parsed, previous_user_id, now_millis())
            .map_err(|e| StorageError::Unauthorized(format!("{e:#}")))
    }
}
