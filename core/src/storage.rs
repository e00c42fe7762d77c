use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::StorageError;

/// Where encrypted backups live. Objects are opaque byte blobs addressed by name.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    async fn upload(&self, name: &str, body: Vec<u8>) -> Result<(), StorageError>;

    /// `Ok(None)` when the object does not exist yet.
    async fn download(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn describe(&self) -> String;
}

/// Stores backups as files in a local directory, e.g. a folder another tool
/// mirrors to the cloud.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StorageError::Transient(format!("invalid object name '{name}'")));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl CloudStorage for DirectoryStorage {
    async fn upload(&self, name: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let path = self.object_path(name)?;
        let io_err = |e: std::io::Error| StorageError::Transient(format!("{}: {e}", path.display()));
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, &body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.object_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Transient(format!("{}: {e}", path.display()))),
        }
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}
