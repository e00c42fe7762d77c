use anyhow::{Context, Result, bail};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::TryRecvError};

use nutrilog_core::config::{ENV_AUTO_SYNC, ProviderConfig, SyncSettings};
use nutrilog_core::db::Database;
use nutrilog_core::error::{SyncError, SyncErrorKind};
use nutrilog_core::storage::CloudStorage;
use nutrilog_core::sync::{PullOutcome, PushOutcome, SyncCoordinator, SyncEvent};

use super::helpers::describe_merge;
use crate::cloud::build_storage;
use crate::config::Config;

/// A journal wired to its sync coordinator for the lifetime of one command.
pub(crate) struct SyncContext {
    db: Arc<Mutex<Database>>,
    coordinator: SyncCoordinator,
    events: broadcast::Receiver<SyncEvent>,
}

impl SyncContext {
    pub fn new(db: Database, config: &Config) -> Result<Self> {
        let settings = config.sync_settings(&db)?;
        let provider = ProviderConfig::from_env()?;
        let storage = build_storage(config, &provider)?;
        Ok(Self::with_storage(db, storage, settings))
    }

    pub fn with_storage(db: Database, storage: Arc<dyn CloudStorage>, settings: SyncSettings) -> Self {
        let db = Arc::new(Mutex::new(db));
        let coordinator = SyncCoordinator::new(storage, db.clone());
        coordinator.configure(settings);
        let events = coordinator.subscribe();
        Self {
            db,
            coordinator,
            events,
        }
    }

    pub fn into_parts(self) -> (Arc<Mutex<Database>>, SyncCoordinator) {
        (self.db, self.coordinator)
    }

    /// Act on the events emitted by the last operation.
    fn settle(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
                    apply_event(&db, &event)?;
                }
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Persist the side effects of a sync event that must outlive the process.
pub(crate) fn apply_event(db: &Database, event: &SyncEvent) -> Result<()> {
    match event {
        SyncEvent::AutoSyncDisabled { reason } => {
            db.set_auto_sync(false)?;
            tracing::warn!("auto-sync disabled: {reason}");
            eprintln!("Auto-sync turned off: {reason}");
        }
        SyncEvent::ReconnectRequired => {
            eprintln!("Cloud storage needs to be reconnected. Run `nutrilog auth login`.");
        }
        _ => {}
    }
    Ok(())
}

fn explain(err: SyncError) -> anyhow::Error {
    let hint = match err.kind() {
        SyncErrorKind::Configuration => {
            "Set NUTRILOG_SYNC_PASSPHRASE or run `nutrilog sync passphrase`"
        }
        SyncErrorKind::AuthExpired => "Run `nutrilog auth login` to reconnect",
        SyncErrorKind::Decryption => {
            "Check that this device uses the same passphrase as the one that uploaded the backup"
        }
        SyncErrorKind::Incompatible => "Update nutrilog on this device to read the newer backup",
        SyncErrorKind::Transient => "Check your connection and try again",
        SyncErrorKind::Local => return anyhow::Error::new(err),
    };
    anyhow::Error::new(err).context(hint)
}

fn fmt_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}

fn print_push(outcome: &PushOutcome) {
    match outcome {
        PushOutcome::Uploaded { records, .. } => println!("Pushed backup with {records} records"),
        PushOutcome::Queued => println!("Another sync is running; the push will follow it"),
    }
}

fn print_pull(outcome: &PullOutcome) {
    match outcome {
        PullOutcome::Merged(report) if report.changed() == 0 => {
            println!("Already up to date");
        }
        PullOutcome::Merged(report) => {
            println!("Pulled {} changes:", report.changed());
            for line in describe_merge(report) {
                println!("  {line}");
            }
        }
        PullOutcome::NothingToPull => println!("No backup in storage yet"),
        PullOutcome::Busy => println!("Another sync is running; try again shortly"),
    }
}

pub(crate) async fn cmd_sync_push(ctx: &mut SyncContext, json: bool) -> Result<()> {
    let result = ctx.coordinator.push().await;
    ctx.settle()?;
    let outcome = result.map_err(explain)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_push(&outcome);
    }
    Ok(())
}

pub(crate) async fn cmd_sync_pull(ctx: &mut SyncContext, json: bool) -> Result<()> {
    let result = ctx.coordinator.pull().await;
    ctx.settle()?;
    let outcome = result.map_err(explain)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_pull(&outcome);
    }
    Ok(())
}

pub(crate) async fn cmd_sync_now(ctx: &mut SyncContext, json: bool) -> Result<()> {
    let result = ctx.coordinator.sync().await;
    ctx.settle()?;
    let outcome = result.map_err(explain)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_pull(&outcome.pull);
        print_push(&outcome.push);
    }
    Ok(())
}

pub(crate) fn cmd_sync_status(ctx: &SyncContext, json: bool) -> Result<()> {
    let status = ctx.coordinator.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let on_off = |b: bool| if b { "on" } else { "off" };
    println!("Storage:    {}", status.storage);
    println!("Auto-sync:  {}", on_off(status.auto_sync));
    println!(
        "Passphrase: {}",
        if status.passphrase_set { "set" } else { "not set" }
    );
    println!(
        "Last push:  {}",
        status.last_push_at.map_or_else(|| "never".to_string(), fmt_millis)
    );
    println!(
        "Last pull:  {}",
        status.last_pull_at.map_or_else(|| "never".to_string(), fmt_millis)
    );
    if let Some(failure) = &status.last_error {
        println!(
            "Last error: {} ({:?}, {})",
            failure.message,
            failure.operation,
            fmt_millis(failure.at)
        );
    }
    Ok(())
}

pub(crate) fn cmd_sync_auto(db: &Database, config: &Config, enabled: bool, json: bool) -> Result<()> {
    db.set_auto_sync(enabled)?;
    let settings = config.sync_settings(db)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "auto_sync": enabled,
                "effective": settings.auto_sync,
                "passphrase_set": settings.passphrase.is_some(),
            })
        );
        return Ok(());
    }

    println!("Auto-sync {}", if enabled { "enabled" } else { "disabled" });
    if settings.auto_sync != enabled {
        eprintln!("Note: {ENV_AUTO_SYNC} is set and overrides this setting");
    }
    if enabled && settings.passphrase.is_none() {
        eprintln!("No sync passphrase yet. Run `nutrilog sync passphrase` before the first sync.");
    }
    Ok(())
}

fn read_passphrase(reader: impl BufRead) -> Result<String> {
    let line = reader
        .lines()
        .next()
        .context("No passphrase given")?
        .context("Failed to read passphrase")?;
    let pass = line.trim_end_matches(['\r', '\n']).to_string();
    if pass.trim().is_empty() {
        bail!("Passphrase must not be empty");
    }
    Ok(pass)
}

pub(crate) fn cmd_sync_passphrase(config: &Config, clear: bool, json: bool) -> Result<()> {
    if clear {
        let removed = config.delete_passphrase()?;
        if json {
            println!("{}", serde_json::json!({ "cleared": removed }));
        } else if removed {
            println!("Sync passphrase removed");
        } else {
            println!("No sync passphrase was stored");
        }
        return Ok(());
    }

    eprint!("Sync passphrase: ");
    io::stderr().flush()?;
    let pass = read_passphrase(io::stdin().lock())?;
    let replaced = config.load_passphrase()?.is_some();
    config.save_passphrase(&pass)?;

    if json {
        println!("{}", serde_json::json!({ "saved": true, "replaced": replaced }));
    } else {
        println!("Sync passphrase saved");
        if replaced {
            eprintln!("Backups encrypted with the previous passphrase can no longer be read");
        }
    }
    Ok(())
}

/// Run one sync after a command changed the journal, if auto-sync is on.
/// Failures are reported but never fail the command itself.
pub(crate) async fn sync_after_change(db: Database, config: &Config) {
    let settings = match config.sync_settings(&db) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("skipping auto-sync: {e:#}");
            return;
        }
    };
    if !settings.auto_sync || settings.passphrase.is_none() {
        return;
    }

    let mut ctx = match ProviderConfig::from_env()
        .map_err(anyhow::Error::from)
        .and_then(|provider| build_storage(config, &provider))
    {
        Ok(storage) => SyncContext::with_storage(db, storage, settings),
        Err(e) => {
            eprintln!("Warning: auto-sync skipped: {e:#}");
            return;
        }
    };

    let result = ctx.coordinator.sync().await;
    if let Err(e) = ctx.settle() {
        tracing::warn!("failed to record sync state: {e:#}");
    }
    match result {
        Ok(outcome) => tracing::info!(?outcome, "auto-sync finished"),
        Err(e) => eprintln!("Warning: auto-sync failed: {:#}", explain(e)),
    }
}
