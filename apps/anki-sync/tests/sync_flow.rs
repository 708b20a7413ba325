//! End-to-end sync tests against an in-process AnkiConnect.

mod common;

use pretty_assertions::assert_eq;

use std::collections::{BTreeMap, BTreeSet};

use anki_sync_core::{DiagnosticKind, Settings};
use anki_sync_lib::sync::{RunOutcome, SyncError, SyncRequest};

use common::fixtures::{self, ids_in};
use common::{Harness, FIRST_NOTE_ID};

/// Test the first sync creates the note and writes its id marker.
#[tokio::test]
async fn test_first_sync_creates_and_writes_ids() {
    let h = Harness::new().await;
    h.write("math.md", &fixtures::document(&[("Q: 2+2?", "A: 4")]));

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_created, 1);
    assert_eq!(report.stats.files_written, 1);
    assert_eq!(ids_in(&h.read("math.md")), vec![FIRST_NOTE_ID]);

    let note = h.anki.note(FIRST_NOTE_ID).unwrap();
    assert_eq!(note.model, "Basic");
    assert_eq!(note.deck, "Default");
    assert!(note.field("Front").contains("2+2"));
    assert!(note.tags.contains(&"Obsidian_to_Anki".to_string()));
}

/// Test a forced rerun over unchanged documents sends nothing.
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = Harness::new().await;
    h.write("math.md", &fixtures::document(&[("Q: 2+2?", "A: 4")]));
    h.sync().await;
    let after_first = h.read("math.md");
    h.anki.reset_calls();

    let report = h.sync_forced().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_unchanged, 1);
    assert_eq!(report.stats.files_written, 0);
    assert_eq!(h.anki.count("addNotes"), 0);
    assert_eq!(h.anki.count("updateNote"), 0);
    assert_eq!(h.anki.count("deleteNotes"), 0);
    assert_eq!(h.read("math.md"), after_first);
}

/// Test editing a field sends exactly one update.
#[tokio::test]
async fn test_edited_note_is_updated() {
    let h = Harness::new().await;
    h.write("math.md", &fixtures::document(&[("Q: 2+2?", "A: 4")]));
    h.sync().await;
    h.anki.reset_calls();

    let edited = h.read("math.md").replace("A: 4", "A: five");
    h.write("math.md", &edited);
    let report = h.sync().await;

    assert_eq!(report.stats.notes_updated, 1);
    assert_eq!(report.stats.notes_created, 0);
    assert_eq!(h.anki.count("updateNote"), 1);
    assert_eq!(h.anki.count("addNotes"), 0);
    assert!(h.anki.note(FIRST_NOTE_ID).unwrap().field("Back").contains("five"));
    assert_eq!(h.read("math.md"), edited);
}

/// Test a changed file deck moves the note's cards.
#[tokio::test]
async fn test_deck_change_moves_cards() {
    let h = Harness::new().await;
    h.write("bio.md", &fixtures::document(&[("Cell?", "Unit of life")]));
    h.sync().await;

    let moved = format!("TARGET DECK: Biology\n{}", h.read("bio.md"));
    h.write("bio.md", &moved);
    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_updated, 1);
    assert_eq!(h.anki.count("changeDeck"), 1);
    assert_eq!(h.anki.note(FIRST_NOTE_ID).unwrap().deck, "Biology");
}

/// Test one rejected create does not hold back its siblings, and is retried
/// once fixed.
#[tokio::test]
async fn test_partial_create_failure_is_isolated() {
    let h = Harness::new().await;
    h.write(
        "mixed.md",
        &fixtures::document(&[("Q1", "A1"), ("FAIL here", "x"), ("Q3", "A3")]),
    );

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedWithDiagnostics);
    assert_eq!(report.stats.notes_created, 2);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::RemoteOperation));
    let text = h.read("mixed.md");
    assert_eq!(ids_in(&text).len(), 2);
    assert!(text.contains("START\nFAIL here\nx\nEND\n"));

    h.write("mixed.md", &text.replace("FAIL here", "fixed"));
    h.anki.reset_calls();
    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_created, 1);
    assert_eq!(report.stats.notes_unchanged, 2);
    assert_eq!(ids_in(&h.read("mixed.md")).len(), 3);
    assert_eq!(h.anki.notes().len(), 3);
}

/// Test a DELETE block removes its note and exactly that block.
#[tokio::test]
async fn test_delete_block_removes_note_and_block() {
    let h = Harness::new().await;
    h.write("cards.md", &fixtures::document(&[("Q1", "A1"), ("Q2", "A2")]));
    h.sync().await;

    let text = h.read("cards.md");
    let first = format!("START\nQ1\nA1\n<!--ID: {}-->\nEND\n", FIRST_NOTE_ID);
    assert!(text.contains(&first));
    h.write("cards.md", &text.replace(&first, &fixtures::delete_block(FIRST_NOTE_ID)));

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_deleted, 1);
    assert!(h.anki.note(FIRST_NOTE_ID).is_none());
    assert!(h.anki.note(FIRST_NOTE_ID + 1).is_some());

    let text = h.read("cards.md");
    assert!(!text.contains("DELETE"));
    assert!(text.contains("Q2"));
    assert_eq!(ids_in(&text), vec![FIRST_NOTE_ID + 1]);
}

/// Test a block removed from its document deletes the note.
#[tokio::test]
async fn test_removed_block_is_deleted() {
    let h = Harness::new().await;
    h.write("cards.md", &fixtures::document(&[("Q1", "A1"), ("Q2", "A2")]));
    h.sync().await;

    let text = h.read("cards.md");
    let second = format!("START\nQ2\nA2\n<!--ID: {}-->\nEND\n", FIRST_NOTE_ID + 1);
    assert!(text.contains(&second));
    h.write("cards.md", &text.replace(&second, ""));
    h.anki.reset_calls();

    let report = h.sync().await;

    assert_eq!(report.stats.notes_deleted, 1);
    assert_eq!(h.anki.count("deleteNotes"), 1);
    assert!(h.anki.note(FIRST_NOTE_ID).is_some());
    assert!(h.anki.note(FIRST_NOTE_ID + 1).is_none());
}

/// Test a block moved to another document keeps its note.
#[tokio::test]
async fn test_moved_block_is_not_deleted() {
    let h = Harness::new().await;
    h.write("a.md", &fixtures::document(&[("Q1", "A1")]));
    h.sync().await;

    let text = h.read("a.md");
    h.write("a.md", "# Emptied\n");
    h.write("b.md", &text);
    h.anki.reset_calls();

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_deleted, 0);
    assert_eq!(h.anki.count("deleteNotes"), 0);
    assert_eq!(h.anki.count("addNotes"), 0);
    assert!(h.anki.note(FIRST_NOTE_ID).is_some());
}

/// Test unchanged documents are skipped until their content changes.
#[tokio::test]
async fn test_smart_scan_skips_unchanged_documents() {
    let h = Harness::new().await;
    h.write("math.md", &fixtures::document(&[("Q: 2+2?", "A: 4")]));
    h.sync().await;

    let report = h.sync().await;
    assert_eq!(report.stats.documents_skipped, 1);
    assert_eq!(report.stats.documents_scanned, 0);

    h.write("math.md", &format!("{}\n", h.read("math.md")));
    let report = h.sync().await;
    assert_eq!(report.stats.documents_scanned, 1);
    assert_eq!(report.stats.notes_unchanged, 1);
}

/// Test an unreachable service aborts before anything changes.
#[tokio::test]
async fn test_unreachable_service_aborts_without_changes() {
    let h = Harness::unreachable("http://127.0.0.1:1").await;
    let text = fixtures::document(&[("Q: 2+2?", "A: 4")]);
    h.write("math.md", &text);

    let err = h.engine.sync(SyncRequest::default()).await.unwrap_err();

    assert!(matches!(err, SyncError::Connectivity(_)));
    assert_eq!(h.read("math.md"), text);
    assert!(!h.engine.is_running());
}

/// Test a create whose id could not be written is adopted on the next run
/// instead of being created twice.
#[tokio::test]
async fn test_pending_writeback_is_adopted() {
    let h = Harness::new().await;
    let text = fixtures::document(&[("Q: 2+2?", "A: 4")]);
    h.write("math.md", &text);

    h.fail_writes(true);
    let report = h.sync().await;
    assert_eq!(report.stats.notes_created, 1);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::DocumentIo));
    assert_eq!(h.read("math.md"), text);

    h.fail_writes(false);
    h.anki.reset_calls();
    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_created, 0);
    assert_eq!(h.anki.count("addNotes"), 0);
    assert_eq!(h.anki.count("addNote"), 0);
    assert_eq!(ids_in(&h.read("math.md")), vec![FIRST_NOTE_ID]);
    assert_eq!(h.anki.notes().len(), 1);
}

/// Test bulk delete removes every marked note and strips the markers.
#[tokio::test]
async fn test_bulk_delete_strips_ids() {
    let h = Harness::new().await;
    h.write("cards.md", &fixtures::document(&[("Q1", "A1"), ("Q2", "A2")]));
    h.sync().await;
    assert_eq!(h.anki.notes().len(), 2);

    let report = h.engine.bulk_delete("cards.md").await.unwrap();

    assert_eq!(report.stats.notes_deleted, 2);
    assert!(h.anki.notes().is_empty());
    let text = h.read("cards.md");
    assert!(ids_in(&text).is_empty());
    assert!(text.contains("Q1"));

    // The blocks are new again.
    let report = h.sync().await;
    assert_eq!(report.stats.notes_created, 2);
}

/// Test referenced media is uploaded once and a missing file is reported
/// without holding back the note.
#[tokio::test]
async fn test_media_upload_and_missing_media() {
    let h = Harness::new().await;
    h.write("img.png", "not really a png");
    h.write(
        "pics.md",
        &fixtures::document(&[("Look ![[img.png]]", "A cell"), ("Where ![[nope.png]]", "gone")]),
    );

    let report = h.sync().await;

    assert_eq!(report.stats.media_uploaded, 1);
    assert_eq!(report.stats.notes_created, 2);
    assert!(h.anki.media().contains("img.png"));
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::MissingMedia));
    assert_eq!(report.outcome, RunOutcome::CompletedWithDiagnostics);
}

/// Test a media file that was missing is uploaded once it appears, and that
/// every document referencing it hears about it while it is missing.
#[tokio::test]
async fn test_missing_media_is_retried_when_it_appears() {
    let h = Harness::new().await;
    h.write("a.md", &fixtures::document(&[("See ![[late.png]]", "first")]));
    h.write("b.md", &fixtures::document(&[("Also ![[late.png]]", "second")]));

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedWithDiagnostics);
    assert_eq!(report.stats.notes_created, 2);
    assert_eq!(report.stats.media_uploaded, 0);
    let reported: BTreeSet<&str> = report
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::MissingMedia)
        .filter_map(|d| d.path.as_deref())
        .collect();
    assert_eq!(reported, BTreeSet::from(["a.md", "b.md"]));
    assert!(h.anki.media().is_empty());

    h.write("late.png", "finally here");
    h.anki.reset_calls();
    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.media_uploaded, 1);
    assert_eq!(report.stats.notes_created, 0);
    assert_eq!(h.anki.count("storeMediaFile"), 1);
    assert!(h.anki.media().contains("late.png"));
}

/// Test a document edited between scan and writeback is left alone, and its
/// new note is adopted on the next run instead of being created again.
#[tokio::test]
async fn test_writeback_conflict_keeps_edit_and_adopts_later() {
    let h = Harness::new().await;
    let text = fixtures::document(&[("Q: 2+2?", "A: 4")]);
    h.write("math.md", &text);
    h.flaky.edit_before_writeback("math.md", "\nEdited while syncing.\n");

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedWithDiagnostics);
    assert_eq!(report.stats.notes_created, 1);
    assert_eq!(report.stats.files_written, 0);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::WritebackConflict));
    let edited = format!("{}\nEdited while syncing.\n", text);
    assert_eq!(h.read("math.md"), edited);

    h.anki.reset_calls();
    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_created, 0);
    assert_eq!(h.anki.count("addNotes"), 0);
    assert_eq!(h.anki.notes().len(), 1);
    let text = h.read("math.md");
    assert_eq!(ids_in(&text), vec![FIRST_NOTE_ID]);
    assert!(text.ends_with("Edited while syncing.\n"));
}

/// Test a second sync while one is running is refused.
#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let h = Harness::new().await;
    h.write("math.md", &fixtures::document(&[("Q: 2+2?", "A: 4")]));

    let (first, second) = tokio::join!(h.engine.sync(SyncRequest::default()), async {
        while !h.engine.is_running() {
            tokio::task::yield_now().await;
        }
        h.engine.sync(SyncRequest::default()).await
    });

    assert!(matches!(second, Err(SyncError::AlreadyInProgress)));
    assert_eq!(first.unwrap().stats.notes_created, 1);
    assert!(!h.engine.is_running());
    assert_eq!(h.anki.notes().len(), 1);
}

/// Test cancelling after notes were created keeps their ids in state, so the
/// next run adopts them rather than creating duplicates.
#[tokio::test]
async fn test_cancel_after_create_persists_state() {
    let h = Harness::new().await;
    let text = fixtures::document(&[("Q1", "A1"), ("Q2", "A2")]);
    h.write("cards.md", &text);
    h.anki.cancel_on("addNotes", h.engine.cancel_flag());

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.stats.notes_created, 2);
    assert_eq!(report.stats.files_written, 0);
    assert_eq!(h.read("cards.md"), text);
    assert_eq!(h.anki.notes().len(), 2);

    h.anki.clear_cancel();
    h.anki.reset_calls();
    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_created, 0);
    assert_eq!(h.anki.count("addNotes"), 0);
    assert_eq!(h.anki.notes().len(), 2);
    assert_eq!(
        ids_in(&h.read("cards.md")),
        vec![FIRST_NOTE_ID, FIRST_NOTE_ID + 1]
    );
}

/// Test a custom regexp turns one block into several notes, each with its
/// own id.
#[tokio::test]
async fn test_custom_regexp_splits_block_into_notes() {
    let mut settings = Settings::default();
    settings
        .custom_regexps
        .insert("Basic".to_string(), r"^Q: (.+)\nA: (.+)$".to_string());
    let h = Harness::with_settings(settings).await;
    h.write(
        "quiz.md",
        "# Quiz\n\nSTART\nQ: one\nA: 1\nQ: two\nA: 2\nEND\n",
    );

    let report = h.sync().await;

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.stats.notes_created, 2);
    assert_eq!(h.anki.note(FIRST_NOTE_ID).unwrap().field("Front"), "one");
    assert_eq!(h.anki.note(FIRST_NOTE_ID + 1).unwrap().field("Back"), "2");
    assert_eq!(
        ids_in(&h.read("quiz.md")),
        vec![FIRST_NOTE_ID, FIRST_NOTE_ID + 1]
    );

    h.anki.reset_calls();
    let report = h.sync_forced().await;
    assert_eq!(report.stats.notes_unchanged, 2);
    assert_eq!(h.anki.count("addNotes"), 0);
}

/// Test folder decks and folder tags apply to documents inside the folder
/// only.
#[tokio::test]
async fn test_folder_decks_and_tags() {
    let mut settings = Settings::default();
    settings.folder_decks = BTreeMap::from([("bio".to_string(), "Biology".to_string())]);
    settings.folder_tags = BTreeMap::from([("bio".to_string(), "science cells".to_string())]);
    let h = Harness::with_settings(settings).await;
    h.write("bio/cell.md", &fixtures::document(&[("Cell?", "Unit of life")]));
    h.write("misc.md", &fixtures::document(&[("Misc?", "Anything")]));

    let report = h.sync().await;
    assert_eq!(report.stats.notes_created, 2);

    let notes = h.anki.notes();
    let cell = notes.values().find(|n| n.field("Front") == "Cell?").unwrap();
    assert_eq!(cell.deck, "Biology");
    assert!(cell.tags.contains(&"science".to_string()));
    assert!(cell.tags.contains(&"cells".to_string()));

    let misc = notes.values().find(|n| n.field("Front") == "Misc?").unwrap();
    assert_eq!(misc.deck, "Default");
    assert!(!misc.tags.contains(&"science".to_string()));
}

/// Test scan tags limit the run to tagged documents.
#[tokio::test]
async fn test_scan_tags_select_documents() {
    let mut settings = Settings::default();
    settings.defaults.scan_tags = "cards".to_string();
    let h = Harness::with_settings(settings).await;
    h.write(
        "tagged.md",
        &format!("---\ntags: [cards]\n---\n{}", fixtures::basic_block("Q1", "A1")),
    );
    let untagged = fixtures::document(&[("Q2", "A2")]);
    h.write("untagged.md", &untagged);

    let report = h.sync().await;

    assert_eq!(report.stats.notes_created, 1);
    assert_eq!(report.stats.documents_skipped, 1);
    assert_eq!(ids_in(&h.read("tagged.md")), vec![FIRST_NOTE_ID]);
    assert_eq!(h.read("untagged.md"), untagged);
}

/// Test documents matching an ignore glob are never synced.
#[tokio::test]
async fn test_ignored_globs_exclude_documents() {
    let mut settings = Settings::default();
    settings.ignored_file_globs.push("drafts/**".to_string());
    let h = Harness::with_settings(settings).await;
    let draft = fixtures::document(&[("Draft?", "Not yet")]);
    h.write("drafts/wip.md", &draft);
    h.write("final.md", &fixtures::document(&[("Final?", "Yes")]));

    let report = h.sync().await;

    assert_eq!(report.stats.notes_created, 1);
    assert_eq!(h.read("drafts/wip.md"), draft);
    assert_eq!(h.anki.notes()[&FIRST_NOTE_ID].field("Front"), "Final?");
}
