//! Batch reconciler: turns classified notes into AnkiConnect calls.
//!
//! One batch per operation type, in a fixed order: decks, media, creates,
//! updates (with deck moves), deletes. Per-item failures are recorded as
//! diagnostics and never discard sibling successes.

use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use anki_sync_core::{missing_ids, Classification, ClassifiedNote, Diagnostic, DiagnosticKind};

use super::scan::ScannedDocument;
use super::{CancelFlag, Progress, RunLog, SyncStage};
use crate::anki::{AnkiApi, AnkiClient, NewNote, NoteOptions, NoteUpdate};
use crate::db::StateSnapshot;
use crate::vault::DocumentStore;

/// What happened to one scanned document's notes.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DocumentOutcome {
    /// Notes that hold an id after this run but had none in the text:
    /// (index into the document's notes, id).
    pub assigned: Vec<(usize, i64)>,
    /// Ids deleted remotely through a delete marker.
    pub deleted: BTreeSet<i64>,
    /// Previously known ids that stay tracked although the text no longer
    /// shows them.
    pub retained: BTreeSet<i64>,
    /// Some item of this document failed and must be retried.
    pub failed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Reconciliation {
    pub outcomes: Vec<DocumentOutcome>,
    pub cancelled: bool,
}

/// Ids to delete because they vanished from a scanned document, and the
/// missing ids that are kept, per document.
///
/// An id still present in any other document, scanned or not, is a move,
/// not a deletion. Documents with scan diagnostics never infer deletions,
/// since a dropped block would look like a removed one.
pub(crate) fn implicit_deletes(
    docs: &[ScannedDocument],
    snapshot: &StateSnapshot,
    delete_missing: bool,
) -> (BTreeMap<i64, usize>, Vec<BTreeSet<i64>>) {
    let scanned: BTreeSet<String> = docs.iter().map(|d| d.handle.path.clone()).collect();
    let mut observed: BTreeSet<i64> = snapshot.ids_outside(&scanned).collect();
    for doc in docs {
        observed.extend(doc.changes.observed_ids());
    }

    let mut deletes = BTreeMap::new();
    let mut retained = Vec::with_capacity(docs.len());
    for (d, doc) in docs.iter().enumerate() {
        let explicit: BTreeSet<i64> = doc
            .changes
            .notes
            .iter()
            .filter(|n| n.class == Classification::Delete)
            .filter_map(ClassifiedNote::id)
            .collect();
        let known = snapshot
            .document(&doc.handle.path)
            .map(|s| s.ids.clone())
            .unwrap_or_default();

        let missing: BTreeSet<i64> = missing_ids(&known, &observed)
            .into_iter()
            .filter(|id| !explicit.contains(id))
            .collect();

        if delete_missing && doc.changes.diagnostics.is_empty() {
            deletes.extend(missing.into_iter().map(|id| (id, d)));
            retained.push(BTreeSet::new());
        } else {
            retained.push(missing);
        }
    }
    (deletes, retained)
}

pub(crate) struct Reconciler<'a, A> {
    pub anki: &'a AnkiClient<A>,
    pub store: &'a dyn DocumentStore,
    pub cancel: &'a CancelFlag,
    pub progress: &'a Progress,
    pub log: &'a mut RunLog,
}

impl<'a, A: AnkiApi> Reconciler<'a, A> {
    pub async fn run(
        &mut self,
        docs: &[ScannedDocument],
        snapshot: &mut StateSnapshot,
        delete_missing: bool,
    ) -> Reconciliation {
        let (missing, retained) = implicit_deletes(docs, snapshot, delete_missing);
        let mut outcomes: Vec<DocumentOutcome> = retained
            .into_iter()
            .map(|retained| DocumentOutcome {
                retained,
                ..Default::default()
            })
            .collect();

        let mut result = Reconciliation::default();
        let stages = [
            SyncStage::UploadingMedia,
            SyncStage::CreatingNotes,
            SyncStage::UpdatingNotes,
            SyncStage::DeletingNotes,
        ];
        for (n, stage) in stages.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Cancelled before {:?}", stage);
                result.cancelled = true;
                // Deletes run last, so none of them were sent.
                for (&id, &d) in &missing {
                    outcomes[d].retained.insert(id);
                }
                break;
            }
            self.progress
                .emit(stage, n, stages.len(), format!("{:?}", stage));
            match stage {
                SyncStage::UploadingMedia => self.upload_media(docs, snapshot, &mut outcomes).await,
                SyncStage::CreatingNotes => self.create_notes(docs, snapshot, &mut outcomes).await,
                SyncStage::UpdatingNotes => self.update_notes(docs, snapshot, &mut outcomes).await,
                SyncStage::DeletingNotes => {
                    self.delete_notes(docs, snapshot, &missing, &mut outcomes)
                        .await
                }
                _ => {}
            }
        }

        result.outcomes = outcomes;
        result
    }

    fn remote_failure(&mut self, doc: &ScannedDocument, note: &ClassifiedNote, message: &str) {
        self.log.record(
            Diagnostic::new(DiagnosticKind::RemoteOperation, message)
                .with_path(&doc.handle.path)
                .with_lines(note.note.source.lines),
        );
    }

    /// Make sure every referenced media file exists remotely.
    ///
    /// Every live note is checked, not only changed ones, so a file that was
    /// missing on an earlier run is uploaded once it appears. A file that
    /// cannot be provided marks each document referencing it for a retry but
    /// does not hold back the notes themselves.
    async fn upload_media(
        &mut self,
        docs: &[ScannedDocument],
        snapshot: &mut StateSnapshot,
        outcomes: &mut [DocumentOutcome],
    ) {
        // filename -> (document index, link as written) for every reference
        let mut wanted: BTreeMap<String, Vec<(usize, String)>> = BTreeMap::new();
        for (d, doc) in docs.iter().enumerate() {
            for note in live(doc) {
                for media in &note.note.media {
                    if snapshot.media.contains(&media.filename) {
                        continue;
                    }
                    let refs = wanted.entry(media.filename.clone()).or_default();
                    if !refs.iter().any(|(seen, _)| *seen == d) {
                        refs.push((d, media.link.clone()));
                    }
                }
            }
        }
        if wanted.is_empty() {
            return;
        }

        match self.anki.media_file_names().await {
            Ok(remote) => {
                wanted.retain(|name, _| {
                    let present = remote.contains(name);
                    if present {
                        snapshot.media.insert(name.clone());
                    }
                    !present
                });
            }
            Err(e) => self.log.record(Diagnostic::new(
                DiagnosticKind::RemoteOperation,
                format!("could not list remote media: {}", e),
            )),
        }

        for (filename, refs) in wanted {
            let found = refs
                .iter()
                .find_map(|(d, link)| self.store.media_path(&docs[*d].handle, link));
            let message = match found {
                Some(path) => match self.anki.store_media_file(&filename, &path).await {
                    Ok(()) => {
                        snapshot.media.insert(filename);
                        self.log.stats.media_uploaded += 1;
                        continue;
                    }
                    Err(e) => format!("upload of {} failed: {}", filename, e),
                },
                None => format!("{} not found in the vault", refs[0].1),
            };
            for (d, _) in refs {
                self.log.record(
                    Diagnostic::new(DiagnosticKind::MissingMedia, message.clone())
                        .with_path(&docs[d].handle.path),
                );
                outcomes[d].failed = true;
            }
        }
    }

    async fn create_notes(
        &mut self,
        docs: &[ScannedDocument],
        snapshot: &mut StateSnapshot,
        outcomes: &mut [DocumentOutcome],
    ) {
        let mut creates = Vec::new();
        for (d, doc) in docs.iter().enumerate() {
            for (i, note) in doc.changes.notes.iter().enumerate() {
                match note.class {
                    Classification::Create => creates.push((d, i)),
                    Classification::Adopt(id) => {
                        snapshot.fingerprints.insert(id, note.note.fingerprint.clone());
                        outcomes[d].assigned.push((i, id));
                    }
                    _ => {}
                }
            }
        }
        if creates.is_empty() {
            return;
        }

        let decks: BTreeSet<&str> = creates
            .iter()
            .map(|&(d, i)| docs[d].changes.notes[i].note.deck.as_str())
            .collect();
        for deck in decks {
            if let Err(e) = self.anki.create_deck(deck).await {
                self.log.record(Diagnostic::new(
                    DiagnosticKind::RemoteOperation,
                    format!("could not create deck {}: {}", deck, e),
                ));
            }
        }

        let payload: Vec<NewNote> = creates
            .iter()
            .map(|&(d, i)| {
                let note = &docs[d].changes.notes[i].note;
                NewNote {
                    deck_name: note.deck.clone(),
                    model_name: note.schema.clone(),
                    fields: field_map(note),
                    tags: note.tags.iter().cloned().collect(),
                    options: NoteOptions::default(),
                }
            })
            .collect();

        let results = match self.anki.add_notes(&payload).await {
            Ok(results) => results,
            Err(e) => vec![Err(e.to_string()); creates.len()],
        };

        for ((d, i), result) in creates.into_iter().zip(results) {
            let doc = &docs[d];
            let note = &doc.changes.notes[i];
            match result {
                Ok(id) => {
                    snapshot.fingerprints.insert(id, note.note.fingerprint.clone());
                    snapshot.add_pending(&doc.handle.path, &note.note.fingerprint, id);
                    outcomes[d].assigned.push((i, id));
                    self.log.stats.notes_created += 1;
                }
                Err(message) => {
                    outcomes[d].failed = true;
                    self.remote_failure(doc, note, &format!("create failed: {}", message));
                }
            }
        }
    }

    async fn update_notes(
        &mut self,
        docs: &[ScannedDocument],
        snapshot: &mut StateSnapshot,
        outcomes: &mut [DocumentOutcome],
    ) {
        let updates: Vec<(usize, usize, i64)> = docs
            .iter()
            .enumerate()
            .flat_map(|(d, doc)| {
                doc.changes
                    .notes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.class == Classification::Update)
                    .filter_map(move |(i, n)| n.note.id.map(|id| (d, i, id)))
            })
            .collect();
        if updates.is_empty() {
            return;
        }

        let payload: Vec<NoteUpdate> = updates
            .iter()
            .map(|&(d, i, id)| {
                let note = &docs[d].changes.notes[i].note;
                NoteUpdate {
                    id,
                    fields: field_map(note),
                    tags: note.tags.iter().cloned().collect(),
                }
            })
            .collect();

        let results = match self.anki.update_notes(&payload).await {
            Ok(results) => results,
            Err(e) => vec![Err(e.to_string()); updates.len()],
        };

        let mut applied = Vec::new();
        for ((d, i, id), result) in updates.into_iter().zip(results) {
            let doc = &docs[d];
            let note = &doc.changes.notes[i];
            match result {
                Ok(()) => {
                    snapshot.fingerprints.insert(id, note.note.fingerprint.clone());
                    self.log.stats.notes_updated += 1;
                    applied.push((d, i, id));
                }
                Err(message) => {
                    outcomes[d].failed = true;
                    self.remote_failure(doc, note, &format!("update failed: {}", message));
                }
            }
        }

        self.move_decks(docs, snapshot, outcomes, applied).await;
    }

    /// Put the cards of updated notes into their note's deck.
    ///
    /// A note whose move fails loses its stored fingerprint so the next run
    /// updates it again.
    async fn move_decks(
        &mut self,
        docs: &[ScannedDocument],
        snapshot: &mut StateSnapshot,
        outcomes: &mut [DocumentOutcome],
        applied: Vec<(usize, usize, i64)>,
    ) {
        if applied.is_empty() {
            return;
        }
        let ids: Vec<i64> = applied.iter().map(|&(_, _, id)| id).collect();
        let cards = match self.anki.note_cards(&ids).await {
            Ok(cards) => cards,
            Err(e) => {
                self.log.record(Diagnostic::new(
                    DiagnosticKind::RemoteOperation,
                    format!("could not look up cards of updated notes: {}", e),
                ));
                for (d, _, id) in applied {
                    snapshot.fingerprints.remove(&id);
                    outcomes[d].failed = true;
                }
                return;
            }
        };

        let mut by_deck: BTreeMap<&str, (Vec<i64>, Vec<(usize, i64)>)> = BTreeMap::new();
        for &(d, i, id) in &applied {
            let entry = by_deck
                .entry(docs[d].changes.notes[i].note.deck.as_str())
                .or_default();
            entry.0.extend(cards.get(&id).into_iter().flatten().copied());
            entry.1.push((d, id));
        }

        for (deck, (card_ids, notes)) in by_deck {
            if let Err(e) = self.anki.change_deck(&card_ids, deck).await {
                self.log.record(Diagnostic::new(
                    DiagnosticKind::RemoteOperation,
                    format!("could not move cards to deck {}: {}", deck, e),
                ));
                for (d, id) in notes {
                    snapshot.fingerprints.remove(&id);
                    outcomes[d].failed = true;
                }
            }
        }
    }

    async fn delete_notes(
        &mut self,
        docs: &[ScannedDocument],
        snapshot: &mut StateSnapshot,
        missing: &BTreeMap<i64, usize>,
        outcomes: &mut [DocumentOutcome],
    ) {
        let mut targets: BTreeMap<i64, (usize, bool)> = missing
            .iter()
            .map(|(&id, &d)| (id, (d, false)))
            .collect();
        for (d, doc) in docs.iter().enumerate() {
            for note in &doc.changes.notes {
                if let (Classification::Delete, Some(id)) = (note.class, note.note.id) {
                    targets.insert(id, (d, true));
                }
            }
        }
        if targets.is_empty() {
            return;
        }

        let ids: Vec<i64> = targets.keys().copied().collect();
        match self.anki.delete_notes(&ids).await {
            Ok(()) => {
                for (id, (d, explicit)) in targets {
                    snapshot.forget_note(id);
                    if explicit {
                        outcomes[d].deleted.insert(id);
                    }
                    self.log.stats.notes_deleted += 1;
                }
            }
            Err(e) => {
                self.log.record(Diagnostic::new(
                    DiagnosticKind::RemoteOperation,
                    format!("delete of {} notes failed: {}", ids.len(), e),
                ));
                for (id, (d, _)) in targets {
                    outcomes[d].retained.insert(id);
                    outcomes[d].failed = true;
                }
            }
        }
    }
}

/// Notes that exist remotely after this run.
fn live(doc: &ScannedDocument) -> impl Iterator<Item = &ClassifiedNote> {
    doc.changes
        .notes
        .iter()
        .filter(|n| n.class != Classification::Delete)
}

fn field_map(note: &anki_sync_core::Note) -> BTreeMap<String, String> {
    note.fields
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
