use anyhow::{Context, Result};
use directories::ProjectDirs;
use secrecy::SecretString;
use std::path::{Path, PathBuf};

use nutrilog_core::config::{ENV_AUTO_SYNC, SyncSettings};
use nutrilog_core::db::Database;
use nutrilog_core::oauth::StoredToken;

const TOKEN_FILE: &str = "token.json";
const PASSPHRASE_FILE: &str = "passphrase";
const API_KEY_FILE: &str = "api_key";

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    /// Target of the local directory storage provider.
    pub backups_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "nutrilog").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir().to_path_buf())
    }

    pub fn in_dir(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Config {
            db_path: data_dir.join("nutrilog.db"),
            backups_dir: data_dir.join("backups"),
            data_dir,
        })
    }

    pub fn token_store(&self) -> TokenStore {
        TokenStore {
            path: self.data_dir.join(TOKEN_FILE),
        }
    }

    /// Sync settings from the environment, falling back to the stored
    /// passphrase and the persisted auto-sync flag.
    pub fn sync_settings(&self, db: &Database) -> Result<SyncSettings> {
        let mut settings = SyncSettings::from_env()?;
        if settings.passphrase.is_none() {
            settings.passphrase = self.load_passphrase()?;
        }
        if std::env::var_os(ENV_AUTO_SYNC).is_none() {
            settings.auto_sync = db.auto_sync_enabled()?;
        }
        Ok(settings)
    }

    pub fn load_passphrase(&self) -> Result<Option<SecretString>> {
        let path = self.data_dir.join(PASSPHRASE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).context("Failed to read passphrase file")?;
        let pass = raw.trim_end_matches(['\r', '\n']);
        Ok((!pass.is_empty()).then(|| SecretString::new(pass.into())))
    }

    pub fn save_passphrase(&self, passphrase: &str) -> Result<()> {
        write_secret_file(&self.data_dir.join(PASSPHRASE_FILE), passphrase)
    }

    pub fn delete_passphrase(&self) -> Result<bool> {
        remove_if_exists(&self.data_dir.join(PASSPHRASE_FILE))
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)`.
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join(API_KEY_FILE);

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        write_secret_file(&path, &key)?;
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

/// OAuth session persisted next to the database.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path).context("Failed to read token file")?;
        let token = serde_json::from_str(&raw).with_context(|| {
            format!(
                "Token file {} is corrupt; run `nutrilog auth login` again",
                self.path.display()
            )
        })?;
        Ok(Some(token))
    }

    pub fn save(&self, token: &StoredToken) -> Result<()> {
        let json = serde_json::to_string_pretty(token)?;
        write_secret_file(&self.path, &json)
    }

    pub fn delete(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }
}

/// Write a file readable only by the owner.
fn write_secret_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
