//! Push/pull of encrypted snapshots and the background auto-sync worker.
//!
//! Only one operation touches storage at a time. A push requested while
//! another operation runs is queued and executed once the current one ends;
//! a pull requested while busy is skipped. Local changes feed a debounced
//! worker that runs a full sync (pull, then push) once things go quiet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::SyncSettings;
use crate::crypto::{decrypt_snapshot, encrypt_snapshot};
use crate::error::{StorageError, SyncError, SyncErrorKind};
use crate::merge::MergeReport;
use crate::models::now_millis;
use crate::snapshot::{BACKUP_OBJECT_NAME, SyncSnapshot};
use crate::storage::CloudStorage;

const EVENT_CAPACITY: usize = 64;

/// Local side of a sync: produces snapshots and applies merges atomically.
pub trait SnapshotStore: Send + Sync {
    fn load_snapshot(&self) -> anyhow::Result<SyncSnapshot>;
    /// Merge `remote` into local data. Reading local state and writing the
    /// result happen without interleaving local edits.
    fn merge_remote(&self, remote: &SyncSnapshot) -> anyhow::Result<MergeReport>;
    fn record_sync(&self, kind: SyncKind, at: i64) -> anyhow::Result<()>;
    fn last_sync(&self, kind: SyncKind) -> anyhow::Result<Option<i64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Encrypting,
    Uploading,
    Downloading,
    Decrypting,
    Merging,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    PhaseChanged { phase: SyncPhase },
    Pushed { at: i64, records: usize },
    Pulled { at: i64, report: MergeReport },
    NothingToPull,
    /// A pull merged remote records into local data; views should reload.
    DataChanged { report: MergeReport },
    PushQueued,
    Failed {
        operation: SyncKind,
        kind: SyncErrorKind,
        message: String,
    },
    ReconnectRequired,
    AutoSyncDisabled { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushOutcome {
    Uploaded { at: i64, records: usize },
    /// Another operation was running; the push will run when it finishes.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PullOutcome {
    Merged(MergeReport),
    NothingToPull,
    /// Another operation was running; nothing was done.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub pull: PullOutcome,
    pub push: PushOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
    pub operation: SyncKind,
    pub kind: SyncErrorKind,
    pub message: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub storage: String,
    pub worker_running: bool,
    pub auto_sync: bool,
    pub passphrase_set: bool,
    pub push_pending: bool,
    pub last_push_at: Option<i64>,
    pub last_pull_at: Option<i64>,
    pub last_error: Option<SyncFailure>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    storage: Arc<dyn CloudStorage>,
    store: Arc<dyn SnapshotStore>,
    settings: Mutex<SyncSettings>,
    phase: Mutex<SyncPhase>,
    last_error: Mutex<Option<SyncFailure>>,
    busy: AtomicBool,
    push_pending: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    trigger: Mutex<Option<mpsc::UnboundedSender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the busy flag when an operation ends, including on cancellation.
struct BusyGuard<'a> {
    inner: &'a Inner,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner.set_phase(SyncPhase::Idle);
        self.inner.busy.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { inner: self })
    }

    fn settings(&self) -> SyncSettings {
        lock(&self.settings).clone()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: SyncPhase) {
        let changed = {
            let mut current = lock(&self.phase);
            let changed = *current != phase;
            *current = phase;
            changed
        };
        if changed {
            self.emit(SyncEvent::PhaseChanged { phase });
        }
    }

    fn passphrase(settings: &SyncSettings) -> Result<SecretString, SyncError> {
        settings
            .passphrase
            .clone()
            .filter(|p| !p.expose_secret().is_empty())
            .ok_or(SyncError::MissingPassphrase)
    }

    async fn push_once(&self) -> Result<PushOutcome, SyncError> {
        let settings = self.settings();
        let passphrase = Self::passphrase(&settings)?;

        self.set_phase(SyncPhase::Encrypting);
        let snapshot = self.store.load_snapshot()?;
        let records = snapshot.counts().total();
        let iterations = settings.kdf_iterations;
        let blob = tokio::task::spawn_blocking(move || {
            encrypt_snapshot(&snapshot, passphrase.expose_secret(), iterations)
        })
        .await
        .map_err(|e| SyncError::Local(anyhow::anyhow!("encryption task failed: {e}")))??;

        self.set_phase(SyncPhase::Uploading);
        settings
            .retry
            .retry_if(
                || self.storage.upload(BACKUP_OBJECT_NAME, blob.clone()),
                StorageError::is_retryable,
            )
            .await?;

        let at = now_millis();
        self.stamp(SyncKind::Push, at);
        tracing::info!(records, "pushed encrypted backup");
        self.emit(SyncEvent::Pushed { at, records });
        Ok(PushOutcome::Uploaded { at, records })
    }

    async fn pull_once(&self) -> Result<PullOutcome, SyncError> {
        let settings = self.settings();
        let passphrase = Self::passphrase(&settings)?;

        self.set_phase(SyncPhase::Downloading);
        let blob = settings
            .retry
            .retry_if(
                || self.storage.download(BACKUP_OBJECT_NAME),
                StorageError::is_retryable,
            )
            .await?;
        let Some(blob) = blob else {
            tracing::info!("no remote backup yet");
            self.emit(SyncEvent::NothingToPull);
            return Ok(PullOutcome::NothingToPull);
        };

        self.set_phase(SyncPhase::Decrypting);
        let remote = tokio::task::spawn_blocking(move || {
            decrypt_snapshot(&blob, passphrase.expose_secret())
        })
        .await
        .map_err(|e| SyncError::Local(anyhow::anyhow!("decryption task failed: {e}")))??;

        self.set_phase(SyncPhase::Merging);
        let report = self.store.merge_remote(&remote)?;
        if report.changed() > 0 {
            self.emit(SyncEvent::DataChanged { report });
        }

        let at = now_millis();
        self.stamp(SyncKind::Pull, at);
        tracing::info!(changed = report.changed(), "pulled remote backup");
        self.emit(SyncEvent::Pulled { at, report });
        Ok(PullOutcome::Merged(report))
    }

    /// Remember when an operation completed. The operation itself already
    /// landed, so a failure here is only logged.
    fn stamp(&self, kind: SyncKind, at: i64) {
        if let Err(e) = self.store.record_sync(kind, at) {
            tracing::warn!(?kind, "could not record sync time: {e:#}");
        }
    }

    /// Drop a push queued behind a pull that failed. Uploading now would
    /// replace a remote backup this device never merged.
    fn discard_queued_push(&self, err: &SyncError) {
        if self.push_pending.swap(false, Ordering::SeqCst) {
            tracing::warn!(kind = ?err.kind(), "dropped queued push after failed pull");
        }
    }

    /// Record the result of an operation. An expired session turns auto-sync off
    /// until the user reconnects.
    fn finish<T>(&self, operation: SyncKind, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match &result {
            Ok(_) => {
                lock(&self.last_error).take();
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                tracing::warn!(?operation, ?kind, "sync failed: {message}");
                *lock(&self.last_error) = Some(SyncFailure {
                    operation,
                    kind,
                    message: message.clone(),
                    at: now_millis(),
                });
                self.emit(SyncEvent::Failed {
                    operation,
                    kind,
                    message,
                });
                if kind == SyncErrorKind::AuthExpired {
                    let was_enabled = {
                        let mut settings = lock(&self.settings);
                        std::mem::replace(&mut settings.auto_sync, false)
                    };
                    self.emit(SyncEvent::ReconnectRequired);
                    if was_enabled {
                        self.emit(SyncEvent::AutoSyncDisabled {
                            reason: "cloud storage session expired".to_string(),
                        });
                    }
                }
            }
        }
        result
    }
}

/// Coordinates sync for one journal. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(storage: Arc<dyn CloudStorage>, store: Arc<dyn SnapshotStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                storage,
                store,
                settings: Mutex::new(SyncSettings::default()),
                phase: Mutex::new(SyncPhase::Idle),
                last_error: Mutex::new(None),
                busy: AtomicBool::new(false),
                push_pending: AtomicBool::new(false),
                events,
                trigger: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn configure(&self, settings: SyncSettings) {
        *lock(&self.inner.settings) = settings;
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        lock(&self.inner.settings).auto_sync = enabled;
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the debounce worker on the current tokio runtime. Calling it again
    /// while running is a no-op.
    pub fn start(&self) -> Result<(), SyncError> {
        let mut worker = lock(&self.inner.worker);
        if worker.is_some() {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Local(anyhow::anyhow!("sync worker needs a tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.trigger) = Some(tx);
        *worker = Some(handle.spawn(debounce_loop(Arc::downgrade(&self.inner), rx)));
        tracing::debug!("sync worker started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut worker = lock(&self.inner.worker);
        lock(&self.inner.trigger).take();
        if let Some(handle) = worker.take() {
            handle.abort();
            tracing::debug!("sync worker stopped");
        }
    }

    /// Tell the worker local data changed. Ignored unless auto-sync is on and
    /// the worker is running.
    pub fn notify_local_change(&self) {
        if !lock(&self.inner.settings).auto_sync {
            return;
        }
        if let Some(tx) = lock(&self.inner.trigger).as_ref() {
            let _ = tx.send(());
        }
    }

    pub async fn push(&self) -> Result<PushOutcome, SyncError> {
        let Some(guard) = self.inner.try_acquire() else {
            self.queue_push();
            return Ok(PushOutcome::Queued);
        };
        let result = self.inner.push_once().await;
        let result = self.inner.finish(SyncKind::Push, result);
        self.release(guard).await;
        result
    }

    pub async fn pull(&self) -> Result<PullOutcome, SyncError> {
        let Some(guard) = self.inner.try_acquire() else {
            tracing::debug!("pull skipped, another sync is running");
            return Ok(PullOutcome::Busy);
        };
        let result = self.inner.pull_once().await;
        let result = self.inner.finish(SyncKind::Pull, result);
        if let Err(err) = &result {
            self.inner.discard_queued_push(err);
        }
        self.release(guard).await;
        result
    }

    /// Pull then push. A failed pull skips the push so an unreadable remote is
    /// never overwritten with local-only data.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let Some(guard) = self.inner.try_acquire() else {
            self.queue_push();
            return Ok(SyncOutcome {
                pull: PullOutcome::Busy,
                push: PushOutcome::Queued,
            });
        };
        let pull = self.inner.pull_once().await;
        let result = match self.inner.finish(SyncKind::Pull, pull) {
            Ok(pull) => {
                let push = self.inner.push_once().await;
                self.inner
                    .finish(SyncKind::Push, push)
                    .map(|push| SyncOutcome { pull, push })
            }
            Err(err) => {
                self.inner.discard_queued_push(&err);
                Err(err)
            }
        };
        self.release(guard).await;
        result
    }

    pub fn status(&self) -> anyhow::Result<SyncStatus> {
        let settings = self.inner.settings();
        Ok(SyncStatus {
            phase: *lock(&self.inner.phase),
            storage: self.inner.storage.describe(),
            worker_running: lock(&self.inner.worker).is_some(),
            auto_sync: settings.auto_sync,
            passphrase_set: Inner::passphrase(&settings).is_ok(),
            push_pending: self.inner.push_pending.load(Ordering::SeqCst),
            last_push_at: self.inner.store.last_sync(SyncKind::Push)?,
            last_pull_at: self.inner.store.last_sync(SyncKind::Pull)?,
            last_error: lock(&self.inner.last_error).clone(),
        })
    }

    fn queue_push(&self) {
        if !self.inner.push_pending.swap(true, Ordering::SeqCst) {
            tracing::debug!("push queued behind running sync");
            self.inner.emit(SyncEvent::PushQueued);
        }
    }

    /// Run queued pushes, then release the busy flag. A push queued between the
    /// last drain and the release is picked up by re-acquiring.
    async fn release(&self, guard: BusyGuard<'_>) {
        let mut guard = Some(guard);
        while let Some(held) = guard.take() {
            while self.inner.push_pending.swap(false, Ordering::SeqCst) {
                let result = self.inner.push_once().await;
                // Reported through events and status.
                let _ = self.inner.finish(SyncKind::Push, result);
            }
            drop(held);
            if self.inner.push_pending.load(Ordering::SeqCst) {
                guard = self.inner.try_acquire();
            }
        }
    }

    async fn run_auto_sync(&self) {
        let settings = self.inner.settings();
        if !settings.auto_sync {
            return;
        }
        if Inner::passphrase(&settings).is_err() {
            tracing::debug!("auto-sync skipped, no passphrase");
            return;
        }
        if let Err(err) = self.sync().await {
            tracing::debug!("auto-sync failed: {err}");
        }
    }
}

async fn debounce_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        loop {
            let Some(delay) = inner.upgrade().map(|i| i.settings().debounce) else {
                return;
            };
            match tokio::time::timeout(delay, rx.recv()).await {
                // Another change: restart the quiet period.
                Ok(Some(())) => {}
                Ok(None) => return,
                Err(_) => break,
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        SyncCoordinator { inner }.run_auto_sync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{NewMealEntry, Nutrients};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const FAST: u32 = 1_000;

    #[derive(Default)]
    struct MemoryStorage {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        uploads: AtomicU32,
        downloads: AtomicU32,
        /// Errors returned, in order, before calls start succeeding.
        failures: Mutex<VecDeque<StorageError>>,
        /// When set, uploads wait for a permit.
        gate: Option<Arc<Semaphore>>,
        /// When set, downloads wait for a permit.
        download_gate: Option<Arc<Semaphore>>,
    }

    impl MemoryStorage {
        fn failing(errors: Vec<StorageError>) -> Self {
            Self {
                failures: Mutex::new(errors.into()),
                ..Self::default()
            }
        }

        fn next_failure(&self) -> Option<StorageError> {
            lock(&self.failures).pop_front()
        }
    }

    #[async_trait]
    impl CloudStorage for MemoryStorage {
        async fn upload(&self, name: &str, body: Vec<u8>) -> Result<(), StorageError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            lock(&self.objects).insert(name.to_string(), body);
            Ok(())
        }

        async fn download(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            if let Some(gate) = &self.download_gate {
                gate.acquire().await.unwrap().forget();
            }
            Ok(lock(&self.objects).get(name).cloned())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn settings(passphrase: &str) -> SyncSettings {
        SyncSettings {
            passphrase: Some(SecretString::new(passphrase.into())),
            auto_sync: false,
            debounce: Duration::from_secs(30),
            kdf_iterations: FAST,
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
        }
    }

    fn journal(entries: &[(&str, f64)]) -> Arc<Mutex<Database>> {
        let db = Database::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        for (name, kcal) in entries {
            db.insert_entry(&NewMealEntry {
                date,
                meal_type: "lunch".to_string(),
                product_id: None,
                name: (*name).to_string(),
                amount_g: None,
                nutrients: Nutrients::calories(*kcal),
            })
            .unwrap();
        }
        Arc::new(Mutex::new(db))
    }

    fn entry_names(db: &Mutex<Database>) -> Vec<String> {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let mut names: Vec<String> = lock(db)
            .get_entries_for_date(date)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        names
    }

    fn coordinator(
        storage: &Arc<MemoryStorage>,
        db: &Arc<Mutex<Database>>,
        passphrase: &str,
    ) -> SyncCoordinator {
        let c = SyncCoordinator::new(storage.clone(), db.clone());
        c.configure(settings(passphrase));
        c
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn push_then_pull_merges_into_other_device() {
        let storage = Arc::new(MemoryStorage::default());
        let laptop = journal(&[("Oatmeal", 300.0)]);
        let phone = journal(&[("Apple", 95.0)]);

        let outcome = coordinator(&storage, &laptop, "pw").push().await.unwrap();
        assert!(matches!(outcome, PushOutcome::Uploaded { records: 1, .. }));

        let phone_sync = coordinator(&storage, &phone, "pw");
        let mut rx = phone_sync.subscribe();
        let PullOutcome::Merged(report) = phone_sync.pull().await.unwrap() else {
            panic!("expected a merge");
        };
        assert_eq!(report.entries.inserted, 1);
        assert_eq!(entry_names(&phone), vec!["Apple", "Oatmeal"]);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, SyncEvent::DataChanged { .. }))
        );
        assert!(phone_sync.status().unwrap().last_pull_at.is_some());
    }

    #[tokio::test]
    async fn sync_converges_two_devices() {
        let storage = Arc::new(MemoryStorage::default());
        let laptop = journal(&[("Oatmeal", 300.0)]);
        let phone = journal(&[("Apple", 95.0)]);
        let laptop_sync = coordinator(&storage, &laptop, "pw");
        let phone_sync = coordinator(&storage, &phone, "pw");

        let first = laptop_sync.sync().await.unwrap();
        assert_eq!(first.pull, PullOutcome::NothingToPull);
        phone_sync.sync().await.unwrap();
        laptop_sync.pull().await.unwrap();

        assert_eq!(entry_names(&laptop), vec!["Apple", "Oatmeal"]);
        assert_eq!(entry_names(&phone), vec!["Apple", "Oatmeal"]);
    }

    #[tokio::test]
    async fn pull_twice_changes_nothing_the_second_time() {
        let storage = Arc::new(MemoryStorage::default());
        let laptop = journal(&[("Oatmeal", 300.0)]);
        let phone = journal(&[]);
        coordinator(&storage, &laptop, "pw").push().await.unwrap();

        let phone_sync = coordinator(&storage, &phone, "pw");
        phone_sync.pull().await.unwrap();
        let PullOutcome::Merged(second) = phone_sync.pull().await.unwrap() else {
            panic!("expected a merge");
        };
        assert_eq!(second.changed(), 0);
    }

    #[tokio::test]
    async fn wrong_passphrase_leaves_local_data_untouched() {
        let storage = Arc::new(MemoryStorage::default());
        let laptop = journal(&[("Oatmeal", 300.0)]);
        let phone = journal(&[("Apple", 95.0)]);
        coordinator(&storage, &laptop, "right").push().await.unwrap();

        let phone_sync = coordinator(&storage, &phone, "wrong");
        let err = phone_sync.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Decryption));
        assert_eq!(entry_names(&phone), vec!["Apple"]);
        // The failed pull must not be followed by a push over the remote.
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);

        let status = phone_sync.status().unwrap();
        assert_eq!(status.last_error.unwrap().kind, SyncErrorKind::Decryption);
        assert!(status.last_pull_at.is_none());
    }

    #[tokio::test]
    async fn missing_passphrase_is_configuration_error() {
        let storage = Arc::new(MemoryStorage::default());
        let db = journal(&[]);
        let sync = SyncCoordinator::new(storage.clone(), db);
        let err = sync.push().await.unwrap_err();
        assert_eq!(err.kind(), SyncErrorKind::Configuration);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_session_disables_auto_sync() {
        let storage = Arc::new(MemoryStorage::failing(vec![StorageError::Unauthorized(
            "401".to_string(),
        )]));
        let db = journal(&[("Oatmeal", 300.0)]);
        let sync = coordinator(&storage, &db, "pw");
        sync.set_auto_sync(true);
        let mut rx = sync.subscribe();

        let err = sync.push().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        assert!(events.contains(&SyncEvent::ReconnectRequired));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SyncEvent::AutoSyncDisabled { .. }))
        );
        let status = sync.status().unwrap();
        assert!(!status.auto_sync);
        assert_eq!(status.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let storage = Arc::new(MemoryStorage::failing(vec![
            StorageError::Transient("503".to_string()),
            StorageError::Transient("timeout".to_string()),
        ]));
        let db = journal(&[("Oatmeal", 300.0)]);
        let sync = coordinator(&storage, &db, "pw");
        sync.set_auto_sync(true);

        sync.push().await.unwrap();
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 3);
        let status = sync.status().unwrap();
        assert!(status.auto_sync);
        assert!(status.last_error.is_none());
        assert!(status.last_push_at.is_some());
    }

    #[tokio::test]
    async fn transient_failure_after_retries_keeps_auto_sync() {
        let storage = Arc::new(MemoryStorage::failing(
            (0..5)
                .map(|_| StorageError::Transient("down".to_string()))
                .collect(),
        ));
        let db = journal(&[]);
        let sync = coordinator(&storage, &db, "pw");
        sync.set_auto_sync(true);

        let err = sync.pull().await.unwrap_err();
        assert_eq!(err.kind(), SyncErrorKind::Transient);
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 3);
        assert!(sync.status().unwrap().auto_sync);
    }

    #[tokio::test]
    async fn push_while_busy_is_queued_and_runs_once() {
        let gate = Arc::new(Semaphore::new(0));
        let storage = Arc::new(MemoryStorage {
            gate: Some(gate.clone()),
            ..MemoryStorage::default()
        });
        let db = journal(&[("Oatmeal", 300.0)]);
        let sync = coordinator(&storage, &db, "pw");
        let mut rx = sync.subscribe();

        let running = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.push().await })
        };
        loop {
            if let SyncEvent::PhaseChanged {
                phase: SyncPhase::Uploading,
            } = rx.recv().await.unwrap()
            {
                break;
            }
        }

        assert_eq!(sync.push().await.unwrap(), PushOutcome::Queued);
        assert_eq!(sync.push().await.unwrap(), PushOutcome::Queued);
        assert_eq!(sync.pull().await.unwrap(), PullOutcome::Busy);
        assert!(sync.status().unwrap().push_pending);

        gate.add_permits(2);
        assert!(matches!(
            running.await.unwrap().unwrap(),
            PushOutcome::Uploaded { .. }
        ));
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 2);
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 0);
        let status = sync.status().unwrap();
        assert!(!status.push_pending);
        assert_eq!(status.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn queued_push_is_dropped_when_pull_fails() {
        let gate = Arc::new(Semaphore::new(0));
        let storage = Arc::new(MemoryStorage {
            download_gate: Some(gate.clone()),
            ..MemoryStorage::default()
        });
        let laptop = journal(&[("Oatmeal", 300.0)]);
        let phone = journal(&[("Apple", 95.0)]);
        coordinator(&storage, &laptop, "right").push().await.unwrap();
        let original = lock(&storage.objects)[BACKUP_OBJECT_NAME].clone();

        let phone_sync = coordinator(&storage, &phone, "wrong");
        let mut rx = phone_sync.subscribe();
        let running = {
            let sync = phone_sync.clone();
            tokio::spawn(async move { sync.sync().await })
        };
        loop {
            if let SyncEvent::PhaseChanged {
                phase: SyncPhase::Downloading,
            } = rx.recv().await.unwrap()
            {
                break;
            }
        }
        assert_eq!(phone_sync.push().await.unwrap(), PushOutcome::Queued);

        gate.add_permits(1);
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Decryption));
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);
        assert!(!phone_sync.status().unwrap().push_pending);

        let remote = lock(&storage.objects)[BACKUP_OBJECT_NAME].clone();
        assert_eq!(remote, original);
        assert_eq!(
            decrypt_snapshot(&remote, "right").unwrap().entries[0].name,
            "Oatmeal"
        );
    }

    /// Delegates to a journal but cannot record sync times.
    struct NoStampStore(Arc<Mutex<Database>>);

    impl SnapshotStore for NoStampStore {
        fn load_snapshot(&self) -> anyhow::Result<SyncSnapshot> {
            self.0.load_snapshot()
        }

        fn merge_remote(&self, remote: &SyncSnapshot) -> anyhow::Result<MergeReport> {
            self.0.merge_remote(remote)
        }

        fn record_sync(&self, _kind: SyncKind, _at: i64) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }

        fn last_sync(&self, kind: SyncKind) -> anyhow::Result<Option<i64>> {
            self.0.last_sync(kind)
        }
    }

    #[tokio::test]
    async fn failing_timestamp_does_not_fail_landed_operations() {
        let storage = Arc::new(MemoryStorage::default());
        let laptop = journal(&[("Oatmeal", 300.0)]);
        let phone = journal(&[]);

        let laptop_sync = SyncCoordinator::new(storage.clone(), Arc::new(NoStampStore(laptop)));
        laptop_sync.configure(settings("pw"));
        assert!(matches!(
            laptop_sync.push().await.unwrap(),
            PushOutcome::Uploaded { records: 1, .. }
        ));

        let phone_sync = SyncCoordinator::new(storage.clone(), Arc::new(NoStampStore(phone.clone())));
        phone_sync.configure(settings("pw"));
        let PullOutcome::Merged(report) = phone_sync.pull().await.unwrap() else {
            panic!("expected a merge");
        };
        assert_eq!(report.entries.inserted, 1);
        assert_eq!(entry_names(&phone), vec!["Oatmeal"]);
        assert!(phone_sync.status().unwrap().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn local_changes_are_debounced_into_one_sync() {
        let storage = Arc::new(MemoryStorage::default());
        let db = journal(&[("Oatmeal", 300.0)]);
        let sync = coordinator(&storage, &db, "pw");
        sync.set_auto_sync(true);
        sync.start().unwrap();
        let mut rx = sync.subscribe();

        for _ in 0..3 {
            sync.notify_local_change();
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 0);

        loop {
            if let SyncEvent::Pushed { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);
        assert!(sync.status().unwrap().worker_running);

        sync.stop();
        assert!(!sync.status().unwrap().worker_running);
    }

    #[tokio::test]
    async fn notify_without_auto_sync_does_nothing() {
        let storage = Arc::new(MemoryStorage::default());
        let db = journal(&[]);
        let sync = coordinator(&storage, &db, "pw");
        sync.start().unwrap();
        sync.notify_local_change();
        tokio::task::yield_now().await;
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 0);
        sync.stop();
    }
}
