//! Writeback stage: id markers for created notes, removal of deleted blocks.

use std::collections::BTreeMap;

use anki_sync_core::writeback::apply;
use anki_sync_core::{content_hash, id_marker, Classification, Diagnostic, DiagnosticKind, Edit};

use super::reconcile::DocumentOutcome;
use super::scan::ScannedDocument;
use super::RunLog;
use crate::db::StateSnapshot;
use crate::vault::DocumentStore;

/// Edits for one document and the ids whose markers they write.
///
/// Ids are bound to a block's notes by position, so a marker is only written
/// for a note whose earlier siblings all carry one. Later notes keep their
/// pending record and are adopted on the next run.
pub(crate) fn plan_edits(doc: &ScannedDocument, outcome: &DocumentOutcome) -> (Vec<Edit>, Vec<i64>) {
    let assigned: BTreeMap<usize, i64> = outcome.assigned.iter().copied().collect();

    let mut blocks: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, note) in doc.changes.notes.iter().enumerate() {
        blocks.entry(note.note.source.span.start).or_default().push(i);
    }

    let mut edits = Vec::new();
    let mut written = Vec::new();
    for mut members in blocks.into_values() {
        let notes = &doc.changes.notes;
        let removed = members.iter().find(|&&i| {
            notes[i].class == Classification::Delete
                && notes[i].note.id.is_some_and(|id| outcome.deleted.contains(&id))
        });
        if let Some(&i) = removed {
            edits.push(Edit::RemoveSpan(notes[i].note.source.span.clone()));
            continue;
        }

        members.sort_by_key(|&i| notes[i].note.index_in_block);
        for i in members {
            let note = &notes[i].note;
            if note.id.is_some() {
                continue;
            }
            let Some(&id) = assigned.get(&i) else {
                break;
            };
            edits.push(Edit::InsertId {
                at: note.source.id_insert_at,
                kind: note.source.kind,
                marker: id_marker(id, note.id_comment),
            });
            written.push(id);
        }
    }
    (edits, written)
}

/// Apply the planned edits to the document on disk.
///
/// Returns the hash of the document as it now stands, or `None` when the
/// writeback was skipped or failed.
pub(crate) fn write_back(
    store: &dyn DocumentStore,
    doc: &ScannedDocument,
    outcome: &DocumentOutcome,
    snapshot: &mut StateSnapshot,
    log: &mut RunLog,
) -> Option<String> {
    let (edits, written) = plan_edits(doc, outcome);
    if edits.is_empty() {
        return Some(doc.hash.clone());
    }

    let current = match store.read_text(&doc.handle) {
        Ok(text) => text,
        Err(e) => {
            log.record(Diagnostic::new(DiagnosticKind::DocumentIo, e.to_string()).with_path(&doc.handle.path));
            return None;
        }
    };
    if content_hash(&current) != doc.hash {
        log.record(
            Diagnostic::new(
                DiagnosticKind::WritebackConflict,
                "document changed since it was scanned; ids will be written next run",
            )
            .with_path(&doc.handle.path),
        );
        return None;
    }

    let text = apply(&current, &edits);
    if let Err(e) = store.write_text(&doc.handle, &text) {
        log.record(Diagnostic::new(DiagnosticKind::DocumentIo, e.to_string()).with_path(&doc.handle.path));
        return None;
    }

    for id in written {
        snapshot.clear_pending(id);
    }
    log.stats.files_written += 1;
    Some(content_hash(&text))
}
