//! Parallel scan stage: read, fast-path check, build and classify documents.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use anki_sync_core::markup::{parse_frontmatter, TagExtractor};
use anki_sync_core::{
    content_hash, detect_changes, needs_scan, Diagnostic, DiagnosticKind, DocumentChanges,
    DocumentContext, NoteBuilder, PendingWriteback, RunConfig,
};

use super::CancelFlag;
use crate::vault::{DocumentHandle, DocumentStore};

/// Documents built at the same time.
pub const SCAN_CONCURRENCY: usize = 4;

/// Read-only inputs shared by every scan task.
pub(crate) struct ScanContext {
    pub config: RunConfig,
    pub hashes: BTreeMap<String, String>,
    pub fingerprints: BTreeMap<i64, String>,
    pub pending: Vec<PendingWriteback>,
    pub scan_tags: BTreeSet<String>,
    pub force: bool,
}

/// A document that went through the builder this run.
#[derive(Debug)]
pub(crate) struct ScannedDocument {
    pub handle: DocumentHandle,
    /// Hash of the text the changes were built from.
    pub hash: String,
    pub changes: DocumentChanges,
}

#[derive(Debug)]
pub(crate) enum ScanResult {
    Scanned(ScannedDocument),
    /// Hash unchanged since the last clean pass.
    Skipped(DocumentHandle),
    /// None of the scan tags present.
    Filtered(DocumentHandle),
    Unreadable(DocumentHandle, Diagnostic),
}

/// Scan `handles` on blocking workers, at most [`SCAN_CONCURRENCY`] at once.
///
/// Results come back in input order. Documents not started before
/// cancellation are left out.
pub(crate) async fn scan_documents(
    store: Arc<dyn DocumentStore>,
    handles: Vec<DocumentHandle>,
    context: Arc<ScanContext>,
    cancel: &CancelFlag,
    mut on_progress: impl FnMut(usize, usize),
) -> Vec<ScanResult> {
    let total = handles.len();
    let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let mut tasks = JoinSet::new();
    let mut started = Vec::with_capacity(total);

    for (index, handle) in handles.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        started.push(handle.clone());
        let store = store.clone();
        let context = context.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            (index, scan_one(store.as_ref(), handle, &context))
        });
    }

    let mut results = Vec::with_capacity(total);
    let mut failures = Vec::new();
    let mut done = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!("Scan task failed: {}", e);
                failures.push(e.to_string());
            }
        }
        done += 1;
        on_progress(done, total);
    }

    // A failed task does not say which document it held; every started
    // document without a result gets the failure reported against it.
    if !failures.is_empty() {
        let finished: BTreeSet<usize> = results.iter().map(|(index, _)| *index).collect();
        let reason = failures.join("; ");
        for (index, handle) in started.into_iter().enumerate() {
            if finished.contains(&index) {
                continue;
            }
            let diagnostic = Diagnostic::new(
                DiagnosticKind::DocumentIo,
                format!("scan task failed: {}", reason),
            )
            .with_path(&handle.path);
            results.push((index, ScanResult::Unreadable(handle, diagnostic)));
        }
    }

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

fn scan_one(store: &dyn DocumentStore, handle: DocumentHandle, ctx: &ScanContext) -> ScanResult {
    let content = match store.read_text(&handle) {
        Ok(text) => text,
        Err(e) => {
            let diagnostic =
                Diagnostic::new(DiagnosticKind::DocumentIo, e.to_string()).with_path(&handle.path);
            return ScanResult::Unreadable(handle, diagnostic);
        }
    };

    let hash = content_hash(&content);
    let stored = ctx.hashes.get(&handle.path).map(String::as_str);
    if !needs_scan(stored, &hash, ctx.config.smart_scan, ctx.force) {
        debug!("{}: unchanged, skipped", handle.path);
        return ScanResult::Skipped(handle);
    }

    if !ctx.scan_tags.is_empty() && !has_scan_tag(&content, &ctx.scan_tags) {
        debug!("{}: no scan tag, skipped", handle.path);
        return ScanResult::Filtered(handle);
    }

    let doc = DocumentContext::new(handle.path.clone(), &content);
    let extraction = NoteBuilder::new(&ctx.config).extract(&content, &doc);
    let mut changes = detect_changes(
        &handle.path,
        extraction.notes,
        &ctx.fingerprints,
        &ctx.pending,
    );
    changes.diagnostics.splice(0..0, extraction.diagnostics);
    debug!("{}: {} notes", handle.path, changes.notes.len());

    ScanResult::Scanned(ScannedDocument {
        handle,
        hash,
        changes,
    })
}

/// Whether the document's frontmatter or inline tags include a scan tag.
pub(crate) fn has_scan_tag(content: &str, scan_tags: &BTreeSet<String>) -> bool {
    let frontmatter = parse_frontmatter(content).unwrap_or_default();
    let (_, inline) = TagExtractor::new().extract(content);
    frontmatter
        .tags
        .iter()
        .chain(&inline)
        .any(|tag| scan_tags.contains(&normalize_tag(tag)))
}

pub(crate) fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('#').replace('/', "::")
}
