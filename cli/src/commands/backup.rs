use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;

use nutrilog_core::config::SyncSettings;
use nutrilog_core::crypto::{decrypt_snapshot, encrypt_snapshot};
use nutrilog_core::db::Database;

use super::helpers::describe_merge;

fn require_passphrase(settings: &SyncSettings) -> Result<&SecretString> {
    settings.passphrase.as_ref().context(
        "No sync passphrase. Set NUTRILOG_SYNC_PASSPHRASE or run `nutrilog sync passphrase`",
    )
}

/// Write the whole journal to `path` as an encrypted backup.
pub(crate) fn cmd_backup_export(
    db: &Database,
    settings: &SyncSettings,
    path: &Path,
    json: bool,
) -> Result<()> {
    let passphrase = require_passphrase(settings)?;
    let snapshot = db.export_snapshot()?;
    let sealed = encrypt_snapshot(&snapshot, passphrase.expose_secret(), settings.kdf_iterations)?;
    std::fs::write(path, &sealed)
        .with_context(|| format!("Failed to write backup to {}", path.display()))?;

    let counts = snapshot.counts();
    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "counts": counts })
        );
    } else {
        println!(
            "Exported {} records ({} entries, {} products, {} weights, {} activity days) to {}",
            counts.total(),
            counts.entries,
            counts.products,
            counts.weights,
            counts.activities,
            path.display()
        );
    }
    Ok(())
}

/// Decrypt a backup file and merge it into the journal.
pub(crate) fn cmd_backup_import(
    db: &Database,
    settings: &SyncSettings,
    path: &Path,
    json: bool,
) -> Result<()> {
    let passphrase = require_passphrase(settings)?;
    let sealed = std::fs::read(path)
        .with_context(|| format!("Failed to read backup {}", path.display()))?;
    let snapshot = decrypt_snapshot(&sealed, passphrase.expose_secret())?;
    let report = db.merge_snapshot(&snapshot)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.changed() == 0 {
        println!("Already up to date; nothing to import");
    } else {
        println!("Imported {} records:", report.changed());
        for line in describe_merge(&report) {
            println!("  {line}");
        }
    }
    Ok(())
}
