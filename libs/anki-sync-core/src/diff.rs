//! Change detection: content hashes, note fingerprints and classification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::Diagnostic;
use crate::error::NoteError;
use crate::types::{FieldMap, Note};

const UNIT_SEP: u8 = 0x1f;
const RECORD_SEP: u8 = 0x1e;

/// SHA-256 of a whole document's text.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whitespace-insensitive digest of everything that is sent to the remote
/// store for a note.
pub fn fingerprint(schema: &str, deck: &str, tags: &BTreeSet<String>, fields: &FieldMap) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schema.as_bytes());
    hasher.update([UNIT_SEP]);
    hasher.update(deck.as_bytes());
    hasher.update([UNIT_SEP]);
    for tag in tags {
        hasher.update(tag.as_bytes());
        hasher.update([RECORD_SEP]);
    }
    hasher.update([UNIT_SEP]);
    for (name, value) in fields.iter() {
        hasher.update(name.as_bytes());
        hasher.update([RECORD_SEP]);
        hasher.update(collapse_whitespace(value).as_bytes());
        hasher.update([UNIT_SEP]);
    }
    format!("{:x}", hasher.finalize())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a document must go through the scanner this run.
///
/// With smart scan on, a document whose hash matches the stored one is
/// skipped; `force` and a missing stored hash always rescan.
pub fn needs_scan(stored_hash: Option<&str>, current_hash: &str, smart_scan: bool, force: bool) -> bool {
    if force || !smart_scan {
        return true;
    }
    stored_hash != Some(current_hash)
}

/// Per-document state carried between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    /// Content hash of the last clean pass; `None` forces a rescan.
    pub hash: Option<String>,
    /// Ids last observed in the document.
    pub ids: BTreeSet<i64>,
}

/// What has to happen to a note this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "id")]
pub enum Classification {
    Unchanged,
    Update,
    Create,
    /// Already created remotely under this id; only the writeback is missing.
    Adopt(i64),
    Delete,
}

/// Classify a note that is not flagged for deletion.
///
/// Pure in (identifier, stored fingerprint, current fingerprint).
pub fn classify(id: Option<i64>, stored: Option<&str>, current: &str) -> Classification {
    match id {
        None => Classification::Create,
        Some(_) if stored == Some(current) => Classification::Unchanged,
        Some(_) => Classification::Update,
    }
}

/// A create confirmed remotely whose id marker is not yet in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWriteback {
    pub path: String,
    pub fingerprint: String,
    pub id: i64,
}

/// A built note together with its classification.
#[derive(Debug, Clone)]
pub struct ClassifiedNote {
    pub note: Note,
    pub class: Classification,
}

impl ClassifiedNote {
    /// The note's id after this run's classification, if it has one.
    pub fn id(&self) -> Option<i64> {
        match self.class {
            Classification::Adopt(id) => Some(id),
            _ => self.note.id,
        }
    }
}

/// Classified notes of one scanned document.
#[derive(Debug, Clone, Default)]
pub struct DocumentChanges {
    pub path: String,
    pub notes: Vec<ClassifiedNote>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DocumentChanges {
    /// Ids that are still live in the document: everything but deletions.
    pub fn observed_ids(&self) -> BTreeSet<i64> {
        self.notes
            .iter()
            .filter(|n| n.class != Classification::Delete)
            .filter_map(ClassifiedNote::id)
            .collect()
    }

    pub fn count(&self, class: Classification) -> usize {
        self.notes.iter().filter(|n| n.class == class).count()
    }

    pub fn has_changes(&self) -> bool {
        self.notes.iter().any(|n| n.class != Classification::Unchanged)
    }
}

/// Classify every note of a freshly scanned document.
///
/// `fingerprints` maps ids to the fingerprint last submitted for them.
/// Notes without an id whose fingerprint matches a pending writeback for the
/// same document adopt that id instead of being created again. A repeated id
/// keeps its first occurrence; later ones are dropped with a diagnostic.
pub fn detect_changes(
    path: &str,
    notes: Vec<Note>,
    fingerprints: &BTreeMap<i64, String>,
    pending: &[PendingWriteback],
) -> DocumentChanges {
    let mut changes = DocumentChanges {
        path: path.to_string(),
        ..Default::default()
    };
    let mut seen = BTreeSet::new();
    let mut claimed = BTreeSet::new();

    for note in notes {
        if let Some(id) = note.id {
            if !seen.insert(id) {
                let err = NoteError::DuplicateId {
                    id,
                    line: note.source.lines.0,
                };
                changes
                    .diagnostics
                    .push(Diagnostic::from_note_error(&err, Some(path)));
                continue;
            }
        }

        let class = if note.delete {
            match note.id {
                Some(_) => Classification::Delete,
                None => continue,
            }
        } else if note.id.is_none() {
            let adopted = pending.iter().find(|p| {
                p.path == path && p.fingerprint == note.fingerprint && !claimed.contains(&p.id)
            });
            match adopted {
                Some(p) => {
                    claimed.insert(p.id);
                    Classification::Adopt(p.id)
                }
                None => Classification::Create,
            }
        } else {
            let stored = note.id.and_then(|id| fingerprints.get(&id));
            classify(note.id, stored.map(String::as_str), &note.fingerprint)
        };

        changes.notes.push(ClassifiedNote { note, class });
    }

    changes
}

/// Ids known for a document that no scanned document mentions any more.
pub fn missing_ids(known: &BTreeSet<i64>, observed: &BTreeSet<i64>) -> Vec<i64> {
    known.difference(observed).copied().collect()
}
