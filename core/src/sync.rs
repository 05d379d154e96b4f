//! Backup, restore and outbox draining between the local store and the
//! spreadsheet mirror.
//!
//! The ledger lock is a plain `std::sync::Mutex`; it is only ever taken
//! inside [`SyncEngine::with_ledger`] and never held across an `.await`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dedup::merge_latest;
use crate::error::MirrorError;
use crate::mirror::{RemoteSnapshot, SheetMirror};
use crate::models::{OutboxEntry, now_timestamp};
use crate::service::LedgerService;
use crate::sheets::{LAST_SYNC_AT_KEY, Workbook};

pub type SharedLedger = Arc<Mutex<LedgerService>>;

/// Backoff schedule for outbox ops that failed to mirror.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Ops that have failed this many times are dropped.
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try after `attempts` failures.
    #[must_use]
    pub fn delay_for(&self, attempts: i64) -> Duration {
        let exponent = u32::try_from(attempts.saturating_sub(1).clamp(0, 20)).unwrap_or(0);
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub connected: bool,
    pub sheet_id: Option<String>,
    pub last_sync_at: Option<String>,
    pub pending_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub transactions: usize,
    pub categories: usize,
    pub synced_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Local collections become exactly the remote ones.
    #[default]
    Replace,
    /// Union of local and remote, newest `updatedAt` winning per id.
    Merge,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePreview {
    pub mode: RestoreMode,
    pub remote_transactions: usize,
    pub remote_categories: usize,
    pub local_transactions: usize,
    pub local_categories: usize,
    pub remote_last_sync_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub preview: RestorePreview,
    pub applied: bool,
    /// Local collection sizes after the restore (unchanged when declined).
    pub transactions: usize,
    pub categories: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub applied: usize,
    pub dropped: usize,
    pub deferred: usize,
    pub remaining: i64,
}

pub struct SyncEngine {
    ledger: SharedLedger,
    workbook: Arc<dyn Workbook>,
    policy: RetryPolicy,
    wake: Notify,
    // Serializes drain passes against each other and against backup/restore.
    pass: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(ledger: SharedLedger, workbook: Arc<dyn Workbook>, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            workbook,
            policy,
            wake: Notify::new(),
            pass: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&LedgerService) -> Result<T>) -> Result<T> {
        let guard = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn mirror(&self) -> Result<SheetMirror> {
        let meta = self.with_ledger(LedgerService::sync_meta)?;
        let sheet_id = meta
            .sheet_id
            .filter(|s| !s.is_empty())
            .ok_or(MirrorError::NotConnected)?;
        Ok(SheetMirror::new(Arc::clone(&self.workbook), sheet_id))
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.with_ledger(|ledger| {
            let meta = ledger.sync_meta()?;
            Ok(SyncStatus {
                connected: meta.is_connected(),
                sheet_id: meta.sheet_id,
                last_sync_at: meta.last_sync_at,
                pending_count: meta.pending_count,
                last_error: ledger.store().db().last_outbox_error()?,
            })
        })
    }

    /// Queued ops in the order they will be mirrored.
    pub fn pending_ops(&self) -> Result<Vec<OutboxEntry>> {
        self.with_ledger(|ledger| ledger.store().db().list_outbox())
    }

    /// Prepare the spreadsheet and remember it. Nothing is stored unless
    /// the spreadsheet could be initialized.
    pub async fn connect(&self, sheet_id: &str) -> Result<SyncStatus> {
        let sheet_id = sheet_id.trim();
        if sheet_id.is_empty() {
            bail!("Spreadsheet id cannot be empty");
        }

        let _pass = self.pass.lock().await;
        SheetMirror::new(Arc::clone(&self.workbook), sheet_id)
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize spreadsheet {sheet_id}"))?;

        self.with_ledger(|ledger| {
            let mut meta = ledger.sync_meta()?;
            if meta.sheet_id.as_deref() != Some(sheet_id) {
                // ops queued for a previous spreadsheet do not apply here
                ledger.store().db().clear_outbox()?;
                meta.last_sync_at = None;
            }
            meta.sheet_id = Some(sheet_id.to_string());
            ledger.store().write_meta(&meta)
        })?;
        tracing::info!(sheet_id, "connected spreadsheet");
        self.status()
    }

    /// Forget the spreadsheet and drop pending ops. Returns how many were dropped.
    pub fn disconnect(&self) -> Result<usize> {
        self.with_ledger(|ledger| {
            let mut meta = ledger.sync_meta()?;
            meta.sheet_id = None;
            ledger.store().write_meta(&meta)?;
            ledger.store().db().clear_outbox()
        })
    }

    /// Overwrite the mirror with the full local snapshot.
    ///
    /// Ops queued before the snapshot was taken are covered by it and are
    /// cleared. On failure local state is left as it was.
    pub async fn backup(&self) -> Result<BackupReport> {
        let _pass = self.pass.lock().await;
        let mirror = self.mirror()?;
        let (snap, high_water) = self.with_ledger(|ledger| {
            Ok((
                ledger.snapshot()?,
                ledger.store().db().outbox_high_water()?,
            ))
        })?;

        mirror.initialize().await?;
        mirror
            .replace_all(&snap.transactions, &snap.categories)
            .await?;
        let synced_at = now_timestamp();
        mirror.set_meta(LAST_SYNC_AT_KEY, &synced_at).await?;

        self.with_ledger(|ledger| {
            let mut meta = ledger.sync_meta()?;
            meta.last_sync_at = Some(synced_at.clone());
            ledger.store().write_meta(&meta)?;
            ledger.store().db().clear_outbox_through(high_water)?;
            Ok(())
        })?;

        tracing::info!(
            transactions = snap.transactions.len(),
            categories = snap.categories.len(),
            "backup complete"
        );
        Ok(BackupReport {
            transactions: snap.transactions.len(),
            categories: snap.categories.len(),
            synced_at,
        })
    }

    /// Fetch the mirror and describe what a restore would do, without changing anything.
    pub async fn preview_restore(&self, mode: RestoreMode) -> Result<RestorePreview> {
        let mirror = self.mirror()?;
        let remote = mirror.fetch_snapshot().await?;
        self.build_preview(mode, &remote)
    }

    /// Pull the mirror into the local store after `confirm` approves the preview.
    pub async fn restore<F>(&self, mode: RestoreMode, confirm: F) -> Result<RestoreOutcome>
    where
        F: FnOnce(&RestorePreview) -> bool,
    {
        let _pass = self.pass.lock().await;
        let mirror = self.mirror()?;
        let remote = mirror.fetch_snapshot().await?;
        let preview = self.build_preview(mode, &remote)?;

        if !confirm(&preview) {
            tracing::info!("restore declined");
            return Ok(RestoreOutcome {
                transactions: preview.local_transactions,
                categories: preview.local_categories,
                preview,
                applied: false,
            });
        }

        let restored_at = now_timestamp();
        let (transactions, categories) = self.with_ledger(|ledger| {
            let (transactions, categories) = match mode {
                RestoreMode::Replace => (remote.transactions, remote.categories),
                RestoreMode::Merge => {
                    let local = ledger.snapshot()?;
                    (
                        merge_latest(local.transactions, remote.transactions),
                        merge_latest(local.categories, remote.categories),
                    )
                }
            };
            ledger
                .store()
                .write(&transactions, &categories, Some(&restored_at))?;
            if mode == RestoreMode::Replace {
                ledger.store().db().clear_outbox()?;
            }
            Ok((transactions.len(), categories.len()))
        })?;

        tracing::info!(?mode, transactions, categories, "restore complete");
        Ok(RestoreOutcome {
            preview,
            applied: true,
            transactions,
            categories,
        })
    }

    fn build_preview(&self, mode: RestoreMode, remote: &RemoteSnapshot) -> Result<RestorePreview> {
        let local = self.with_ledger(LedgerService::snapshot)?;
        Ok(RestorePreview {
            mode,
            remote_transactions: remote.transactions.len(),
            remote_categories: remote.categories.len(),
            local_transactions: local.transactions.len(),
            local_categories: local.categories.len(),
            remote_last_sync_at: remote.last_sync_at.clone(),
        })
    }

    /// Wake the background drain task.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_at(Utc::now()).await
    }

    /// Mirror every outbox op that is due at `now`, in queue order.
    ///
    /// A retryable failure reschedules the op and ends the pass; the
    /// remaining ops keep their place for the next pass.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let _pass = self.pass.lock().await;
        let mut report = DrainReport::default();

        let meta = self.with_ledger(LedgerService::sync_meta)?;
        let Some(sheet_id) = meta.sheet_id.filter(|s| !s.is_empty()) else {
            return Ok(report);
        };
        let mirror = SheetMirror::new(Arc::clone(&self.workbook), sheet_id);

        let now_ts = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let due = self.with_ledger(|ledger| ledger.store().db().due_outbox(&now_ts))?;

        for entry in due {
            match mirror.apply(&entry.op).await {
                Ok(()) => {
                    self.with_ledger(|ledger| ledger.store().db().complete_op(entry.id))?;
                    report.applied += 1;
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(outbox_id = entry.id, "dropping op: {e}");
                    self.with_ledger(|ledger| ledger.store().db().complete_op(entry.id))?;
                    report.dropped += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    if attempts >= self.policy.max_attempts {
                        tracing::error!(
                            outbox_id = entry.id,
                            entity = entry.op.entity(),
                            id = entry.op.entity_id(),
                            attempts,
                            "giving up on op: {e}"
                        );
                        self.with_ledger(|ledger| ledger.store().db().complete_op(entry.id))?;
                        report.dropped += 1;
                    } else {
                        let delay = chrono::Duration::from_std(self.policy.delay_for(attempts))
                            .unwrap_or_else(|_| chrono::Duration::hours(1));
                        let next_at = (now + delay).to_rfc3339_opts(SecondsFormat::Millis, true);
                        self.with_ledger(|ledger| {
                            ledger
                                .store()
                                .db()
                                .record_op_failure(entry.id, &e.to_string(), &next_at)
                        })?;
                        report.deferred += 1;
                    }
                    if e.is_retryable() {
                        tracing::warn!("mirror unavailable, pausing outbox: {e}");
                        break;
                    }
                }
            }
        }

        report.remaining = self.with_ledger(|ledger| ledger.store().db().outbox_len())?;
        Ok(report)
    }

    /// Drain on a fixed interval and whenever [`SyncEngine::notify`] is called.
    pub fn spawn_drain_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = engine.wake.notified() => {}
                }
                match engine.drain().await {
                    Ok(report) if report.applied + report.dropped + report.deferred > 0 => {
                        tracing::debug!(
                            applied = report.applied,
                            dropped = report.dropped,
                            deferred = report.deferred,
                            remaining = report.remaining,
                            "outbox drained"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("outbox drain failed: {e:#}"),
                }
            }
        })
    }
}
