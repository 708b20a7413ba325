//! Core types shared by the pipeline stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;

/// Kind of note block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Regular,
    Inline,
}

/// Where a block sits in its document, recorded at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSource {
    pub kind: BlockKind,
    /// First and last source line, 1-indexed and inclusive.
    pub lines: (usize, usize),
    /// Byte range of the whole block, delimiters and id markers included.
    pub span: Range<usize>,
    /// Byte offset where new id markers are inserted.
    pub id_insert_at: usize,
}

/// A delimited span of text recognised as one or more notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub source: BlockSource,
    /// Body text with marker lines stripped.
    pub body: String,
    /// Text after the frozen-fields marker, if any.
    pub frozen: Option<String>,
    pub schema: Option<String>,
    pub deck: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Existing identifiers, in marker order.
    pub ids: Vec<i64>,
    pub delete: bool,
}

impl RawBlock {
    pub fn kind(&self) -> BlockKind {
        self.source.kind
    }

    pub fn lines(&self) -> (usize, usize) {
        self.source.lines
    }
}

/// Ordered field name -> content map whose keys are fixed by a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMap(Vec<(String, String)>);

impl FieldMap {
    /// Empty values for every field in `names`.
    pub fn new(names: &[String]) -> Self {
        Self(names.iter().map(|n| (n.clone(), String::new())).collect())
    }

    /// Assign values positionally; extra values are ignored.
    pub fn with_values<I, S>(names: &[String], values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new(names);
        for (slot, value) in map.0.iter_mut().zip(values) {
            slot.1 = value.into();
        }
        map
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Append `value` to a field, separated by `sep` when the field is not empty.
    pub fn append(&mut self, name: &str, value: &str, sep: &str) {
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| n == name) {
            if !slot.1.is_empty() {
                slot.1.push_str(sep);
            }
            slot.1.push_str(value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut String> {
        self.0.iter_mut().map(|(_, v)| v)
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|(_, v)| v.trim().is_empty())
    }
}

/// A media file referenced from field content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MediaReference {
    /// Name the file is stored under remotely.
    pub filename: String,
    /// Link target as written in the document, used to find the local file.
    pub link: String,
}

/// Canonical, schema-bound note built from a raw block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub schema: String,
    pub fields: FieldMap,
    pub tags: BTreeSet<String>,
    pub deck: String,
    pub id: Option<i64>,
    pub fingerprint: String,
    pub media: Vec<MediaReference>,
    pub delete: bool,
    /// Wrap this note's id marker in an HTML comment.
    pub id_comment: bool,
    /// Position of this note among the notes of its block.
    pub index_in_block: usize,
    pub source: BlockSource,
}

/// Frontmatter values the builder consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontmatter {
    pub tags: Vec<String>,
    pub aliases: Vec<String>,
}
