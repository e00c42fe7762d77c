//! Sync and provider settings read from the environment.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::crypto::{DEFAULT_PBKDF2_ITERATIONS, MAX_PBKDF2_ITERATIONS};
use crate::retry::RetryPolicy;

pub const ENV_STORAGE_URL: &str = "NUTRILOG_STORAGE_URL";
pub const ENV_OAUTH_AUTHORIZE_URL: &str = "NUTRILOG_OAUTH_AUTHORIZE_URL";
pub const ENV_OAUTH_EXCHANGE_URL: &str = "NUTRILOG_OAUTH_EXCHANGE_URL";
pub const ENV_OAUTH_REFRESH_URL: &str = "NUTRILOG_OAUTH_REFRESH_URL";
pub const ENV_OAUTH_CLIENT_ID: &str = "NUTRILOG_OAUTH_CLIENT_ID";
pub const ENV_OAUTH_REDIRECT_URI: &str = "NUTRILOG_OAUTH_REDIRECT_URI";
pub const ENV_SYNC_PASSPHRASE: &str = "NUTRILOG_SYNC_PASSPHRASE";
pub const ENV_AUTO_SYNC: &str = "NUTRILOG_AUTO_SYNC";
pub const ENV_AUTO_SYNC_DELAY_SECS: &str = "NUTRILOG_AUTO_SYNC_DELAY_SECS";
pub const ENV_KDF_ITERATIONS: &str = "NUTRILOG_KDF_ITERATIONS";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);
const DEFAULT_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
/// Anything lower would make offline guessing cheap.
const MIN_KDF_ITERATIONS: u32 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("{0} is required when NUTRILOG_OAUTH_CLIENT_ID is set")]
    Missing(&'static str),
}

/// Knobs for the sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub passphrase: Option<SecretString>,
    pub auto_sync: bool,
    /// Quiet period after the last local change before an automatic sync runs.
    pub debounce: Duration,
    pub kdf_iterations: u32,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            passphrase: None,
            auto_sync: false,
            debounce: DEFAULT_DEBOUNCE,
            kdf_iterations: DEFAULT_PBKDF2_ITERATIONS,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(pass) = get(ENV_SYNC_PASSPHRASE).filter(|p| !p.is_empty()) {
            settings.passphrase = Some(SecretString::new(pass.into()));
        }
        if let Some(raw) = get(ENV_AUTO_SYNC) {
            settings.auto_sync = parse_bool(ENV_AUTO_SYNC, &raw)?;
        }
        if let Some(raw) = get(ENV_AUTO_SYNC_DELAY_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: ENV_AUTO_SYNC_DELAY_SECS,
                reason: format!("'{raw}' is not a number of seconds"),
            })?;
            settings.debounce = Duration::from_secs(secs);
        }
        if let Some(raw) = get(ENV_KDF_ITERATIONS) {
            let iterations: u32 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: ENV_KDF_ITERATIONS,
                reason: format!("'{raw}' is not a positive integer"),
            })?;
            if !(MIN_KDF_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&iterations) {
                return Err(ConfigError::Invalid {
                    var: ENV_KDF_ITERATIONS,
                    reason: format!(
                        "must be between {MIN_KDF_ITERATIONS} and {MAX_PBKDF2_ITERATIONS}"
                    ),
                });
            }
            settings.kdf_iterations = iterations;
        }
        Ok(settings)
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            reason: format!("'{raw}' is not a boolean"),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    pub authorize_url: String,
    pub exchange_url: String,
    pub refresh_url: String,
    pub client_id: String,
    pub redirect_uri: String,
}

/// Where backups go. With no storage URL the local directory provider is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    pub storage_url: Option<String>,
    pub oauth: Option<OAuthConfig>,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let storage_url = non_empty(ENV_STORAGE_URL).map(|u| u.trim_end_matches('/').to_string());
        if let Some(url) = &storage_url {
            require_http(ENV_STORAGE_URL, url)?;
        }

        let oauth = match non_empty(ENV_OAUTH_CLIENT_ID) {
            None => None,
            Some(client_id) => {
                let required = |var: &'static str| -> Result<String, ConfigError> {
                    let url = non_empty(var).ok_or(ConfigError::Missing(var))?;
                    require_http(var, &url)?;
                    Ok(url)
                };
                Some(OAuthConfig {
                    authorize_url: required(ENV_OAUTH_AUTHORIZE_URL)?,
                    exchange_url: required(ENV_OAUTH_EXCHANGE_URL)?,
                    refresh_url: required(ENV_OAUTH_REFRESH_URL)?,
                    client_id,
                    redirect_uri: non_empty(ENV_OAUTH_REDIRECT_URI)
                        .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
                })
            }
        };

        Ok(Self { storage_url, oauth })
    }
}

fn require_http(var: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            var,
            reason: format!("'{url}' must start with http:// or https://"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn sync_settings_defaults() {
        let settings = SyncSettings::from_env_with(env(&[])).unwrap();
        assert!(settings.passphrase.is_none());
        assert!(!settings.auto_sync);
        assert_eq!(settings.debounce, DEFAULT_DEBOUNCE);
        assert_eq!(settings.kdf_iterations, DEFAULT_PBKDF2_ITERATIONS);
    }

    #[test]
    fn sync_settings_from_env() {
        let settings = SyncSettings::from_env_with(env(&[
            (ENV_SYNC_PASSPHRASE, "hunter2"),
            (ENV_AUTO_SYNC, "on"),
            (ENV_AUTO_SYNC_DELAY_SECS, "5"),
            (ENV_KDF_ITERATIONS, "50000"),
        ]))
        .unwrap();
        assert_eq!(settings.passphrase.unwrap().expose_secret(), "hunter2");
        assert!(settings.auto_sync);
        assert_eq!(settings.debounce, Duration::from_secs(5));
        assert_eq!(settings.kdf_iterations, 50_000);
    }

    #[test]
    fn sync_settings_rejects_bad_values() {
        assert!(SyncSettings::from_env_with(env(&[(ENV_AUTO_SYNC, "maybe")])).is_err());
        assert!(SyncSettings::from_env_with(env(&[(ENV_KDF_ITERATIONS, "10")])).is_err());
        assert!(SyncSettings::from_env_with(env(&[(ENV_KDF_ITERATIONS, "4000000000")])).is_err());
        assert!(SyncSettings::from_env_with(env(&[(ENV_AUTO_SYNC_DELAY_SECS, "-1")])).is_err());
    }

    #[test]
    fn provider_config_without_env_is_local() {
        let config = ProviderConfig::from_env_with(env(&[])).unwrap();
        assert_eq!(config, ProviderConfig::default());
    }

    #[test]
    fn provider_config_trims_storage_url() {
        let config =
            ProviderConfig::from_env_with(env(&[(ENV_STORAGE_URL, "https://store.example/v1/")]))
                .unwrap();
        assert_eq!(config.storage_url.as_deref(), Some("https://store.example/v1"));
        assert!(
            ProviderConfig::from_env_with(env(&[(ENV_STORAGE_URL, "ftp://nope")])).is_err()
        );
    }

    #[test]
    fn provider_config_oauth_requires_endpoints() {
        let err = ProviderConfig::from_env_with(env(&[(ENV_OAUTH_CLIENT_ID, "app")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ENV_OAUTH_AUTHORIZE_URL)));

        let config = ProviderConfig::from_env_with(env(&[
            (ENV_OAUTH_CLIENT_ID, "app"),
            (ENV_OAUTH_AUTHORIZE_URL, "https://auth.example/authorize"),
            (ENV_OAUTH_EXCHANGE_URL, "https://auth.example/exchange"),
            (ENV_OAUTH_REFRESH_URL, "https://auth.example/refresh"),
        ]))
        .unwrap();
        let oauth = config.oauth.unwrap();
        assert_eq!(oauth.client_id, "app");
        assert_eq!(oauth.redirect_uri, DEFAULT_REDIRECT_URI);
    }
}
