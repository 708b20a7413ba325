//! Writeback text transform: id marker insertion and block removal.
//!
//! Edits are keyed by byte offsets recorded at scan time. Callers must make
//! sure the document text is the one that was scanned.

use regex::Regex;
use std::ops::Range;

use crate::config::SyntaxConfig;
use crate::scanner::id_line_regex;
use crate::types::BlockKind;

/// Marker text for an id, optionally wrapped in an HTML comment.
pub fn id_marker(id: i64, comment: bool) -> String {
    if comment {
        format!("<!--ID: {id}-->")
    } else {
        format!("ID: {id}")
    }
}

/// A single change to a document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Insert an id marker at a block's recorded insertion point.
    InsertId {
        at: usize,
        kind: BlockKind,
        marker: String,
    },
    /// Remove a whole block span.
    RemoveSpan(Range<usize>),
}

impl Edit {
    fn start(&self) -> usize {
        match self {
            Self::InsertId { at, .. } => *at,
            Self::RemoveSpan(range) => range.start,
        }
    }
}

/// Apply edits to `text`.
///
/// Inserts at the same offset keep their relative order. Edits that fall
/// inside a removed span, or outside the text, are skipped.
pub fn apply(text: &str, edits: &[Edit]) -> String {
    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let mut ordered: Vec<&Edit> = edits.iter().collect();
    ordered.sort_by_key(|e| e.start());

    let mut out = String::with_capacity(text.len() + edits.len() * 24);
    let mut cursor = 0;

    for edit in ordered {
        let start = edit.start();
        let Some(before) = text.get(cursor..start) else {
            continue;
        };
        out.push_str(before);
        cursor = start;

        match edit {
            Edit::InsertId { kind, marker, .. } => {
                out.push_str(marker);
                out.push_str(match kind {
                    BlockKind::Regular => newline,
                    BlockKind::Inline => " ",
                });
            }
            Edit::RemoveSpan(range) => {
                if text.is_char_boundary(range.end) && range.end <= text.len() {
                    cursor = range.end;
                }
            }
        }
    }

    out.push_str(&text[cursor..]);
    out
}

/// Remove every id marker from a document, returning the new text and the
/// ids that were removed, in document order.
pub fn strip_id_markers(text: &str, syntax: &SyntaxConfig) -> (String, Vec<i64>) {
    let id_line = id_line_regex();
    let inline = Regex::new(&format!(
        r"(?:<!--\s*ID:\s*(\d+)\s*-->|\bID:\s*(\d+))\s*({})",
        regex::escape(&syntax.end_inline_note)
    ))
    .expect("valid inline id regex");

    let mut ids = Vec::new();
    let mut out = String::with_capacity(text.len());

    for raw in text.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        if let Some(caps) = id_line.captures(line) {
            if let Some(id) = parse_id(&caps) {
                ids.push(id);
                continue;
            }
        }
        if syntax.end_inline_note.is_empty() {
            out.push_str(raw);
            continue;
        }
        let replaced = inline.replace_all(raw, |caps: &regex::Captures<'_>| {
            if let Some(id) = parse_id(caps) {
                ids.push(id);
            }
            caps[3].to_string()
        });
        out.push_str(&replaced);
    }

    (out, ids)
}

fn parse_id(caps: &regex::Captures<'_>) -> Option<i64> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}
