//! HTTP object storage for encrypted backups, authorized with the OAuth session.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;

use nutrilog_core::config::ProviderConfig;
use nutrilog_core::error::StorageError;
use nutrilog_core::models::now_millis;
use nutrilog_core::oauth::StoredToken;
use nutrilog_core::storage::{CloudStorage, DirectoryStorage};

use crate::config::{Config, TokenStore};
use crate::oauth::TokenClient;

/// Objects live at `{base_url}/{name}`: `PUT` to upload, `GET` to download.
pub struct HttpCloudStorage {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<StoredToken>,
    refresher: Option<TokenClient>,
    token_store: Option<TokenStore>,
}

impl HttpCloudStorage {
    pub fn new(base_url: &str, token: StoredToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("nutrilog/{}", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(token),
            refresher: None,
            token_store: None,
        })
    }

    /// Refresh expired or rejected tokens through `refresher`, saving new ones to `store`.
    #[must_use]
    pub fn with_refresh(mut self, refresher: TokenClient, store: TokenStore) -> Self {
        self.refresher = Some(refresher);
        self.token_store = Some(store);
        self
    }

    fn current_token(&self) -> StoredToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn access_token(&self) -> Result<String, StorageError> {
        let token = self.current_token();
        if token.is_expired_at(now_millis()) {
            tracing::debug!("access token expired, refreshing");
            return self.refresh_token().await;
        }
        Ok(token.access_token)
    }

    async fn refresh_token(&self) -> Result<String, StorageError> {
        let Some(refresher) = &self.refresher else {
            return Err(StorageError::Unauthorized(
                "session expired and no refresh endpoint is configured".to_string(),
            ));
        };
        let user_id = self.current_token().user_id;
        let fresh = refresher.refresh(&user_id).await?;
        if let Some(store) = &self.token_store {
            if let Err(e) = store.save(&fresh) {
                tracing::warn!("could not persist refreshed token: {e:#}");
            }
        }
        let access = fresh.access_token.clone();
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(access)
    }

    /// Send a request with the current token. A 401/403 triggers one refresh
    /// and retry; a second rejection means the session is gone.
    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response, StorageError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.access_token().await?;
        let resp = build(&token).send().await.map_err(transient)?;
        if !is_auth_failure(resp.status()) {
            return Ok(resp);
        }

        tracing::debug!(status = %resp.status(), "storage rejected token, refreshing");
        let token = self.refresh_token().await?;
        let resp = build(&token).send().await.map_err(transient)?;
        if is_auth_failure(resp.status()) {
            return Err(StorageError::Unauthorized(format!(
                "storage rejected a freshly refreshed token ({})",
                resp.status()
            )));
        }
        Ok(resp)
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{name}", self.base_url)
    }
}

fn is_auth_failure(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 401 | 403)
}

fn transient(e: reqwest::Error) -> StorageError {
    StorageError::Transient(format!("storage request failed: {e}"))
}

fn status_error(status: reqwest::StatusCode) -> StorageError {
    StorageError::Transient(format!("storage returned {status}"))
}

#[async_trait]
impl CloudStorage for HttpCloudStorage {
    async fn upload(&self, name: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let url = self.object_url(name);
        let resp = self
            .send_authorized(|token| {
                self.client
                    .put(&url)
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let url = self.object_url(name);
        let resp = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let bytes = resp.bytes().await.map_err(transient)?;
                Ok(Some(bytes.to_vec()))
            }
            s => Err(status_error(s)),
        }
    }

    fn describe(&self) -> String {
        format!("cloud storage at {}", self.base_url)
    }
}

/// The configured storage provider: HTTP storage when a storage URL is set,
/// otherwise the local backups directory.
pub fn build_storage(config: &Config, provider: &ProviderConfig) -> Result<Arc<dyn CloudStorage>> {
    let Some(url) = &provider.storage_url else {
        return Ok(Arc::new(DirectoryStorage::new(&config.backups_dir)));
    };
    let store = config.token_store();
    let token = store
        .load()?
        .context("Not connected to cloud storage. Run `nutrilog auth login` first")?;
    let mut storage = HttpCloudStorage::new(url, token)?;
    if let Some(oauth) = &provider.oauth {
        storage = storage.with_refresh(TokenClient::new(oauth.clone())?, store);
    }
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutrilog_core::config::OAuthConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token(access: &str, expires_at: i64) -> StoredToken {
        StoredToken {
            user_id: "user-7".to_string(),
            access_token: access.to_string(),
            expires_at,
        }
    }

    fn refresher(server: &MockServer) -> TokenClient {
        TokenClient::new(OAuthConfig {
            authorize_url: format!("{}/authorize", server.uri()),
            exchange_url: format!("{}/exchange", server.uri()),
            refresh_url: format!("{}/refresh", server.uri()),
            client_id: "nutrilog".to_string(),
            redirect_uri: "urn:ietf:wg:oauth:2.0:oob".to_string(),
        })
        .unwrap()
    }

    async fn mount_refresh(server: &MockServer, new_token: &str) {
        Mock::given(method("POST"))
            .and(path("/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"access_token": new_token, "expires_in": 3600}),
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn upload_and_download_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/store/backup.json"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/store/backup.json"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"blob".to_vec()))
            .mount(&server)
            .await;

        let storage =
            HttpCloudStorage::new(&format!("{}/store/", server.uri()), token("tok", 0)).unwrap();
        storage.upload("backup.json", b"blob".to_vec()).await.unwrap();
        let body = storage.download("backup.json").await.unwrap();
        assert_eq!(body.as_deref(), Some(&b"blob"[..]));
    }

    #[tokio::test]
    async fn missing_object_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = HttpCloudStorage::new(&server.uri(), token("tok", 0)).unwrap();
        assert!(storage.download("backup.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let storage = HttpCloudStorage::new(&server.uri(), token("tok", 0)).unwrap();
        let err = storage.upload("backup.json", vec![1]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_once_and_persisted() {
        let server = MockServer::start().await;
        mount_refresh(&server, "fresh").await;
        Mock::given(method("GET"))
            .and(path("/backup.json"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/backup.json"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        let storage = HttpCloudStorage::new(&server.uri(), token("stale", 0))
            .unwrap()
            .with_refresh(refresher(&server), store.clone());

        let body = storage.download("backup.json").await.unwrap();
        assert_eq!(body.as_deref(), Some(&b"data"[..]));
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.access_token, "fresh");
        assert_eq!(saved.user_id, "user-7");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_request() {
        let server = MockServer::start().await;
        mount_refresh(&server, "fresh").await;
        Mock::given(method("PUT"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let storage = HttpCloudStorage::new(&server.uri(), token("old", 1))
            .unwrap()
            .with_refresh(
                refresher(&server),
                TokenStore::new(dir.path().join("token.json")),
            );
        storage.upload("backup.json", vec![1, 2]).await.unwrap();
    }

    #[tokio::test]
    async fn rejection_without_refresher_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let storage = HttpCloudStorage::new(&server.uri(), token("tok", 0)).unwrap();
        let err = storage.download("backup.json").await.unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn repeated_rejection_is_unauthorized() {
        let server = MockServer::start().await;
        mount_refresh(&server, "fresh").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let storage = HttpCloudStorage::new(&server.uri(), token("stale", 0))
            .unwrap()
            .with_refresh(
                refresher(&server),
                TokenStore::new(dir.path().join("token.json")),
            );
        let err = storage.download("backup.json").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn local_directory_without_storage_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();
        let storage = build_storage(&config, &ProviderConfig::default()).unwrap();
        assert!(storage.describe().contains("backups"));

        let remote = ProviderConfig {
            storage_url: Some("https://store.example".to_string()),
            oauth: None,
        };
        let err = build_storage(&config, &remote).err().unwrap();
        assert!(format!("{err:#}").contains("auth login"));
    }
}
