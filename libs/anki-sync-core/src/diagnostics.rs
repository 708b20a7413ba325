//! Typed, non-fatal problems collected during a run.

use serde::Serialize;
use std::fmt;

use crate::error::NoteError;

/// Category of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Unterminated or structurally invalid block; the block was dropped.
    MalformedBlock,
    /// Block names a note type the remote store does not have.
    UnknownSchema,
    /// A configured custom regexp failed to compile.
    InvalidRegexp,
    /// Frozen text changed how a block splits into notes; the fingerprints
    /// of that block cover the frozen text too.
    FrozenSplit,
    /// A referenced media file could not be found or uploaded.
    MissingMedia,
    /// A create/update/delete/media call failed for one item.
    RemoteOperation,
    /// The document changed on disk between scan and writeback.
    WritebackConflict,
    /// A document could not be read or written.
    DocumentIo,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedBlock => "malformed block",
            Self::UnknownSchema => "unknown note type",
            Self::InvalidRegexp => "invalid regexp",
            Self::FrozenSplit => "frozen text changes split",
            Self::MissingMedia => "missing media",
            Self::RemoteOperation => "remote operation failed",
            Self::WritebackConflict => "writeback conflict",
            Self::DocumentIo => "document io",
        }
    }
}

/// A diagnostic tied to a document and, when known, a line range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<(usize, usize)>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: None,
            lines: None,
            message: message.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_lines(mut self, lines: (usize, usize)) -> Self {
        self.lines = Some(lines);
        self
    }

    /// Wrap a note error raised while processing `path`.
    pub fn from_note_error(err: &NoteError, path: Option<&str>) -> Self {
        let kind = match err {
            NoteError::UnterminatedBlock { .. } | NoteError::DuplicateId { .. } => {
                DiagnosticKind::MalformedBlock
            }
            NoteError::UnknownSchema { .. } => DiagnosticKind::UnknownSchema,
            NoteError::InvalidRegexp { .. } => DiagnosticKind::InvalidRegexp,
        };
        Self {
            kind,
            path: path.map(str::to_string),
            lines: err.lines(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind.as_str())?;
        if let Some(path) = &self.path {
            write!(f, " {}", path)?;
            if let Some((start, end)) = self.lines {
                if start == end {
                    write!(f, ":{}", start)?;
                } else {
                    write!(f, ":{}-{}", start, end)?;
                }
            }
        }
        write!(f, ": {}", self.message)
    }
}
