use serde::Serialize;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Failures reported by a cloud storage provider.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The session is gone and a refresh did not help. The user has to reconnect.
    #[error("storage session expired: {0}")]
    Unauthorized(String),
    /// Network trouble, timeouts, 5xx responses. Worth retrying.
    #[error("storage provider error: {0}")]
    Transient(String),
}

impl StorageError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Transient,
    AuthExpired,
    Decryption,
    /// The backup needs a newer app version.
    Incompatible,
    Configuration,
    Local,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cloud storage unavailable: {0}")]
    Transient(String),
    #[error("cloud storage session expired; reconnect your account")]
    AuthExpired,
    #[error("could not decrypt the backup: wrong passphrase or corrupted data")]
    Decryption,
    #[error("remote backup uses format version {found}; this app reads up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("no sync passphrase configured")]
    MissingPassphrase,
    #[error("local data error: {0:#}")]
    Local(#[from] anyhow::Error),
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Transient(_) => SyncErrorKind::Transient,
            SyncError::AuthExpired => SyncErrorKind::AuthExpired,
            SyncError::Decryption => SyncErrorKind::Decryption,
            SyncError::UnsupportedVersion { .. } => SyncErrorKind::Incompatible,
            SyncError::MissingPassphrase => SyncErrorKind::Configuration,
            SyncError::Local(_) => SyncErrorKind::Local,
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unauthorized(_) => SyncError::AuthExpired,
            StorageError::Transient(msg) => SyncError::Transient(msg),
        }
    }
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Decryption => SyncError::Decryption,
            CryptoError::UnsupportedVersion { found, supported } => {
                SyncError::UnsupportedVersion { found, supported }
            }
            CryptoError::EmptyPassphrase => SyncError::MissingPassphrase,
            other => SyncError::Local(anyhow::Error::new(other)),
        }
    }
}
