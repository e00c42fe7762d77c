//! OAuth 2.0 authorization-code flow with PKCE (RFC 7636).
//!
//! The network half lives in the CLI. This module builds the authorization URL,
//! generates verifiers and models the tokens that get persisted.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::OAuthConfig;

const VERIFIER_LEN: usize = 64;
const STATE_LEN: usize = 32;
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
/// Tokens are refreshed this long before they actually expire.
pub const EXPIRY_SKEW_MS: i64 = 60_000;

fn random_unreserved(len: usize) -> String {
    let mut r = rng();
    (0..len)
        .map(|_| UNRESERVED[r.random_range(0..UNRESERVED.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    #[must_use]
    pub fn generate() -> Self {
        Self::from_verifier(random_unreserved(VERIFIER_LEN))
    }

    #[must_use]
    pub fn from_verifier(verifier: String) -> Self {
        let challenge = challenge_for(&verifier);
        Self { verifier, challenge }
    }
}

/// S256 code challenge: base64url(sha256(verifier)) without padding.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[must_use]
pub fn random_state() -> String {
    random_unreserved(STATE_LEN)
}

#[must_use]
pub fn authorization_url(config: &OAuthConfig, pkce: &PkcePair, state: &str) -> String {
    let params = [
        ("response_type", "code"),
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("code_challenge", pkce.challenge.as_str()),
        ("code_challenge_method", "S256"),
        ("state", state),
    ];
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if config.authorize_url.contains('?') { '&' } else { '?' };
    format!("{}{sep}{query}", config.authorize_url)
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if UNRESERVED.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Body sent to the token exchange endpoint.
#[derive(Debug, Serialize)]
pub struct ExchangeRequest<'a> {
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: &'a str,
    pub client_id: &'a str,
}

/// Body sent to the refresh endpoint.
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub user_id: &'a str,
}

#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub user_id: String,
    pub access_token: String,
    /// Unix millis. Zero means the provider gave no expiry.
    pub expires_at: i64,
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("user_id", &self.user_id)
            .field("access_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl StoredToken {
    /// Build from a provider response. Refresh responses may omit the user id,
    /// in which case the previous one is carried over.
    pub fn from_response(
        response: TokenResponse,
        previous_user_id: Option<&str>,
        now_ms: i64,
    ) -> anyhow::Result<Self> {
        let user_id = response
            .user_id
            .or_else(|| previous_user_id.map(str::to_string))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("token response did not include a user id"))?;
        if response.access_token.is_empty() {
            anyhow::bail!("token response did not include an access token");
        }
        let expires_at = response
            .expires_in
            .filter(|s| *s > 0)
            .map_or(0, |secs| now_ms + secs * 1000);
        Ok(Self {
            user_id,
            access_token: response.access_token,
            expires_at,
        })
    }

    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at != 0 && now_ms + EXPIRY_SKEW_MS >= self.expires_at
    }
}
