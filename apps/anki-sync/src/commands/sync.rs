//! `sync` and `delete-ids` commands.

use anyhow::bail;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::App;
use crate::anki::AnkiApi;
use crate::settings;
use crate::sync::{RunOutcome, SyncEngine, SyncError, SyncReport, SyncRequest};
use crate::vault::Scope;

pub async fn sync(
    app: &App,
    file: Option<String>,
    folder: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let scope = match (file, folder) {
        (Some(file), _) => Scope::File(app.relative_path(&file)),
        (None, Some(folder)) => Scope::Folder(app.relative_path(&folder)),
        (None, None) => Scope::Vault,
    };

    let report = run_sync(&app.engine, SyncRequest { scope, force }).await?;

    // Note-type field selections may have been repaired during the run.
    let current = app.engine.settings().await;
    if let Err(e) = settings::save(&app.settings_path, &current) {
        warn!("Could not save settings: {}", e);
    }

    finish(&report)
}

pub async fn delete_ids(app: &App, file: &str) -> anyhow::Result<()> {
    let path = app.relative_path(file);
    match app.engine.bulk_delete(&path).await {
        Ok(report) => {
            print_report(&report);
            finish(&report)
        }
        Err(e) => abort(e),
    }
}

/// Run one sync with progress logging and Ctrl-C cancellation.
pub async fn run_sync<A: AnkiApi>(
    engine: &SyncEngine<A>,
    request: SyncRequest,
) -> anyhow::Result<SyncReport> {
    let progress = log_progress(engine);
    let cancel = engine.cancel_flag();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Cancelling after the current step...");
            cancel.cancel();
        }
    });

    let result = engine.sync(request).await;
    ctrl_c.abort();
    progress.abort();

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(report)
        }
        Err(e) => abort(e),
    }
}

fn log_progress<A: AnkiApi>(engine: &SyncEngine<A>) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(
                "{:?} {}/{}: {}",
                event.stage, event.current, event.total, event.status
            );
        }
    })
}

fn abort<T>(err: SyncError) -> anyhow::Result<T> {
    match err {
        SyncError::Connectivity(_) => {
            println!("{}: {}", RunOutcome::AbortedNoChanges, err);
            bail!("sync aborted")
        }
        other => Err(other.into()),
    }
}

fn finish(report: &SyncReport) -> anyhow::Result<()> {
    match report.outcome {
        RunOutcome::CompletedClean | RunOutcome::CompletedWithDiagnostics => Ok(()),
        RunOutcome::Cancelled => bail!("sync cancelled"),
        RunOutcome::AbortedNoChanges => bail!("sync aborted"),
    }
}

pub fn print_report(report: &SyncReport) {
    let stats = &report.stats;
    println!(
        "{}: {} created, {} updated, {} deleted, {} unchanged; {} documents scanned, {} skipped, {} written, {} media uploaded",
        report.outcome,
        stats.notes_created,
        stats.notes_updated,
        stats.notes_deleted,
        stats.notes_unchanged,
        stats.documents_scanned,
        stats.documents_skipped,
        stats.files_written,
        stats.media_uploaded,
    );
    for diagnostic in &report.diagnostics {
        println!("  {}", diagnostic);
    }
}
