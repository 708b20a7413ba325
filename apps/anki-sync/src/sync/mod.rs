//! Sync engine: scan documents, reconcile with AnkiConnect, write ids back.
//!
//! A run is strictly staged:
//! 1. connectivity check (failure aborts before anything changes)
//! 2. note types are fetched and frozen with the settings into a `RunConfig`
//! 3. documents are scanned, built and classified in parallel
//! 4. the reconciler issues one batch per operation type
//! 5. documents with new ids or removed blocks are rewritten
//! 6. the state snapshot is saved in one transaction

pub mod error;
pub(crate) mod reconcile;
pub(crate) mod scan;
pub(crate) mod writeback;

pub use error::SyncError;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use anki_sync_core::{
    split_tags, strip_id_markers, Classification, Diagnostic, DiagnosticKind, RunConfig, Settings,
};

use crate::anki::{AnkiApi, AnkiClient};
use crate::db::{DbError, StateRepository, StateSnapshot};
use crate::vault::{DocumentStore, HostError, Scope};
use reconcile::Reconciler;
use scan::{ScanContext, ScanResult};

type Result<T> = std::result::Result<T, SyncError>;

/// Shared cooperative cancellation flag, checked between documents and
/// between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sync status for display.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SyncStatus {
    Idle,
    Syncing { stage: SyncStage, progress: f32 },
    Completed { synced_at: String, stats: SyncStats },
    Failed { error: String },
}

/// Current sync stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStage {
    Connecting,
    LoadingNoteTypes,
    Scanning,
    UploadingMedia,
    CreatingNotes,
    UpdatingNotes,
    DeletingNotes,
    WritingFiles,
    SavingState,
}

/// A discrete progress step.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: SyncStage,
    pub current: usize,
    pub total: usize,
    pub status: String,
}

/// Sync statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub documents_scanned: usize,
    pub documents_skipped: usize,
    pub notes_created: usize,
    pub notes_updated: usize,
    pub notes_deleted: usize,
    pub notes_unchanged: usize,
    pub media_uploaded: usize,
    pub files_written: usize,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    AbortedNoChanges,
    CompletedWithDiagnostics,
    CompletedClean,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AbortedNoChanges => "aborted-no-changes",
            Self::CompletedWithDiagnostics => "completed-with-diagnostics",
            Self::CompletedClean => "completed-clean",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub outcome: RunOutcome,
    pub stats: SyncStats,
    pub diagnostics: Vec<Diagnostic>,
    pub synced_at: DateTime<Utc>,
}

/// What a run should look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub scope: Scope,
    /// Rescan documents even when their hash is unchanged.
    pub force: bool,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            scope: Scope::Vault,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Progress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Progress {
    pub fn emit(&self, stage: SyncStage, current: usize, total: usize, status: impl Into<String>) {
        // No subscribers is fine.
        let _ = self.tx.send(ProgressEvent {
            stage,
            current,
            total,
            status: status.into(),
        });
    }
}

/// Statistics and diagnostics accumulated during a run.
#[derive(Debug, Default)]
pub(crate) struct RunLog {
    pub stats: SyncStats,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunLog {
    pub fn record(&mut self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    fn into_report(self, outcome: RunOutcome) -> SyncReport {
        let outcome = match outcome {
            RunOutcome::CompletedClean if !self.diagnostics.is_empty() => {
                RunOutcome::CompletedWithDiagnostics
            }
            other => other,
        };
        SyncReport {
            outcome,
            stats: self.stats,
            diagnostics: self.diagnostics,
            synced_at: Utc::now(),
        }
    }
}

/// Inner state shared across clones.
struct SyncEngineInner<A> {
    anki: AnkiClient<A>,
    store: Arc<dyn DocumentStore>,
    state: std::sync::Mutex<Box<dyn StateRepository + Send>>,
    settings: Mutex<Settings>,
    running: AtomicBool,
    cancel: CancelFlag,
    status: Mutex<SyncStatus>,
    progress: Progress,
}

/// Sync engine.
///
/// Clone-able because all state lives behind an `Arc`. At most one run is
/// active at a time; a second request fails with
/// [`SyncError::AlreadyInProgress`] instead of queueing.
pub struct SyncEngine<A> {
    inner: Arc<SyncEngineInner<A>>,
}

impl<A> Clone for SyncEngine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Clears the run flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<A: AnkiApi> SyncEngine<A> {
    pub fn new(
        api: A,
        store: Arc<dyn DocumentStore>,
        state: impl StateRepository + Send + 'static,
        settings: Settings,
    ) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SyncEngineInner {
                anki: AnkiClient::new(api),
                store,
                state: std::sync::Mutex::new(Box::new(state)),
                settings: Mutex::new(settings),
                running: AtomicBool::new(false),
                cancel: CancelFlag::default(),
                status: Mutex::new(SyncStatus::Idle),
                progress: Progress { tx },
            }),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        self.inner.status.lock().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Progress events of every later run.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.tx.subscribe()
    }

    /// Flag that cancels the active run when set.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.inner.cancel.clone()
    }

    pub async fn settings(&self) -> Settings {
        self.inner.settings.lock().await.clone()
    }

    pub async fn set_settings(&self, settings: Settings) {
        *self.inner.settings.lock().await = settings;
    }

    /// Run one sync over `request.scope`.
    ///
    /// Connectivity failures return `Err` before any mutation. Everything
    /// after that point is reported through the returned report.
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncReport> {
        let _guard = self.begin()?;
        self.inner.cancel.reset();

        let result = self.run(request).await;
        self.finish(&result).await;
        result
    }

    /// Delete every note whose id marker appears in `path`, then strip the
    /// markers from the file.
    pub async fn bulk_delete(&self, path: &str) -> Result<SyncReport> {
        let _guard = self.begin()?;
        let result = self.run_bulk_delete(path).await;
        self.finish(&result).await;
        result
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadyInProgress)?;
        Ok(RunGuard(&self.inner.running))
    }

    async fn finish(&self, result: &Result<SyncReport>) {
        let status = match result {
            Ok(report) => SyncStatus::Completed {
                synced_at: report.synced_at.to_rfc3339(),
                stats: report.stats.clone(),
            },
            Err(e) => SyncStatus::Failed {
                error: e.to_string(),
            },
        };
        *self.inner.status.lock().await = status;
    }

    async fn stage(&self, stage: SyncStage, current: usize, total: usize, status: &str) {
        let progress = if total == 0 {
            0.0
        } else {
            current as f32 / total as f32
        };
        *self.inner.status.lock().await = SyncStatus::Syncing { stage, progress };
        self.inner.progress.emit(stage, current, total, status);
    }

    async fn check_connectivity(&self) -> Result<()> {
        self.stage(SyncStage::Connecting, 0, 1, "checking AnkiConnect")
            .await;
        let version = self
            .inner
            .anki
            .version()
            .await
            .map_err(|e| SyncError::Connectivity(e.to_string()))?;
        debug!("AnkiConnect version {}", version);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<StateSnapshot> {
        let state = self
            .inner
            .state
            .lock()
            .map_err(|_| DbError::InvalidData("state store lock poisoned".to_string()))?;
        Ok(state.load_snapshot()?)
    }

    fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| DbError::InvalidData("state store lock poisoned".to_string()))?;
        Ok(state.save_snapshot(snapshot)?)
    }

    async fn run(&self, request: SyncRequest) -> Result<SyncReport> {
        let inner = &self.inner;
        let mut log = RunLog::default();

        // 1. Connectivity
        self.check_connectivity().await?;

        // 2. Note types and the frozen run configuration
        self.stage(SyncStage::LoadingNoteTypes, 0, 1, "loading note types")
            .await;
        let models = inner.anki.model_names().await?;
        let fields = inner.anki.model_field_names(&models).await?;
        let settings = {
            let mut settings = inner.settings.lock().await;
            settings.reconcile_note_types(&fields);
            settings.clone()
        };
        let (config, config_diagnostics) = RunConfig::new(&settings, &fields);
        for diagnostic in config_diagnostics {
            log.record(diagnostic);
        }
        let delete_missing = config.delete_missing;

        // 3. State and documents
        let mut snapshot = self.load_snapshot()?;
        let handles = inner.store.list_documents(&request.scope)?;
        if request.scope == Scope::Vault {
            let listed: BTreeSet<&str> = handles.iter().map(|h| h.path.as_str()).collect();
            snapshot.documents.retain(|path, _| {
                let keep = listed.contains(path.as_str());
                if !keep {
                    debug!("{}: no longer in the vault, forgetting it", path);
                }
                keep
            });
            snapshot
                .pending
                .retain(|p| listed.contains(p.path.as_str()));
        }
        info!("Scanning {} documents", handles.len());

        // 4. Scan, build, classify
        let context = Arc::new(ScanContext {
            config,
            hashes: snapshot
                .documents
                .iter()
                .filter_map(|(path, doc)| doc.hash.clone().map(|h| (path.clone(), h)))
                .collect(),
            fingerprints: snapshot.fingerprints.clone(),
            pending: snapshot.pending.clone(),
            scan_tags: split_tags(&settings.defaults.scan_tags)
                .iter()
                .map(|t| scan::normalize_tag(t))
                .collect(),
            force: request.force,
        });
        let progress = inner.progress.clone();
        let results = scan::scan_documents(
            inner.store.clone(),
            handles,
            context,
            &inner.cancel,
            |current, total| progress.emit(SyncStage::Scanning, current, total, "scanning documents"),
        )
        .await;

        let mut scanned = Vec::new();
        for result in results {
            match result {
                ScanResult::Scanned(doc) => {
                    log.stats.documents_scanned += 1;
                    log.stats.notes_unchanged += doc.changes.count(Classification::Unchanged);
                    for diagnostic in &doc.changes.diagnostics {
                        log.record(diagnostic.clone());
                    }
                    scanned.push(doc);
                }
                ScanResult::Skipped(_) | ScanResult::Filtered(_) => {
                    log.stats.documents_skipped += 1;
                }
                ScanResult::Unreadable(_, diagnostic) => log.record(diagnostic),
            }
        }

        if inner.cancel.is_cancelled() {
            info!("Sync cancelled during scan; nothing was sent");
            return Ok(log.into_report(RunOutcome::Cancelled));
        }

        // 5. Remote batches
        let reconciliation = Reconciler {
            anki: &inner.anki,
            store: inner.store.as_ref(),
            cancel: &inner.cancel,
            progress: &inner.progress,
            log: &mut log,
        }
        .run(&scanned, &mut snapshot, delete_missing)
        .await;
        let cancelled = reconciliation.cancelled || inner.cancel.is_cancelled();

        // 6. Writeback and per-document state
        let total = scanned.len();
        for (n, (doc, outcome)) in scanned.iter().zip(&reconciliation.outcomes).enumerate() {
            self.stage(SyncStage::WritingFiles, n, total, &doc.handle.path)
                .await;
            let hash = if cancelled {
                None
            } else {
                writeback::write_back(inner.store.as_ref(), doc, outcome, &mut snapshot, &mut log)
            };
            let clean = !cancelled
                && !outcome.failed
                && hash.is_some()
                && !snapshot.has_pending(&doc.handle.path);

            let mut ids = doc.changes.observed_ids();
            ids.extend(outcome.assigned.iter().map(|&(_, id)| id));
            ids.extend(&outcome.retained);
            for id in &outcome.deleted {
                ids.remove(id);
            }

            let state = snapshot.document_mut(&doc.handle.path);
            state.ids = ids;
            state.hash = if clean { hash } else { None };
        }

        // 7. Persist
        self.stage(SyncStage::SavingState, 0, 1, "saving state").await;
        if !cancelled {
            snapshot.last_sync_at = Some(Utc::now());
        }
        snapshot.prune_fingerprints();
        self.save_snapshot(&snapshot)?;

        let stats = &log.stats;
        info!(
            "Sync finished: {} created, {} updated, {} deleted, {} unchanged",
            stats.notes_created, stats.notes_updated, stats.notes_deleted, stats.notes_unchanged
        );
        Ok(log.into_report(if cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::CompletedClean
        }))
    }

    async fn run_bulk_delete(&self, path: &str) -> Result<SyncReport> {
        let inner = &self.inner;
        let mut log = RunLog::default();

        self.check_connectivity().await?;

        let handle = inner
            .store
            .list_documents(&Scope::File(path.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| HostError::NotFound(path.to_string()))?;
        let text = inner.store.read_text(&handle)?;
        let syntax = inner.settings.lock().await.syntax.clone();
        let (stripped, ids) = strip_id_markers(&text, &syntax);
        if ids.is_empty() {
            info!("{}: no ids to delete", handle.path);
            return Ok(log.into_report(RunOutcome::CompletedClean));
        }

        self.stage(SyncStage::DeletingNotes, 0, ids.len(), &handle.path)
            .await;
        inner.anki.delete_notes(&ids).await?;
        log.stats.notes_deleted = ids.len();

        let mut snapshot = self.load_snapshot()?;
        for id in &ids {
            snapshot.forget_note(*id);
        }
        snapshot.document_mut(&handle.path).hash = None;

        match inner.store.write_text(&handle, &stripped) {
            Ok(()) => log.stats.files_written += 1,
            Err(e) => log.record(
                Diagnostic::new(DiagnosticKind::DocumentIo, e.to_string()).with_path(&handle.path),
            ),
        }

        self.save_snapshot(&snapshot)?;
        info!("{}: deleted {} notes", handle.path, ids.len());
        Ok(log.into_report(RunOutcome::CompletedClean))
    }
}
