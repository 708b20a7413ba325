//! Error types for anki-sync-core.

use thiserror::Error;

/// Result type alias using NoteError.
pub type Result<T> = std::result::Result<T, NoteError>;

/// Errors that can occur while scanning or building notes.
///
/// None of these abort a run; each one drops the offending block and is
/// surfaced to the caller as a [`crate::Diagnostic`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NoteError {
    #[error("unterminated block starting at line {line}")]
    UnterminatedBlock { line: usize },

    #[error("unknown note type `{name}` at lines {start}-{end}")]
    UnknownSchema {
        name: String,
        start: usize,
        end: usize,
    },

    #[error("invalid custom regexp for note type `{schema}`: {message}")]
    InvalidRegexp { schema: String, message: String },

    #[error("duplicate ID {id} at line {line}")]
    DuplicateId { id: i64, line: usize },
}

impl NoteError {
    /// Source line range the error refers to, when it has one.
    pub fn lines(&self) -> Option<(usize, usize)> {
        match self {
            Self::UnterminatedBlock { line } | Self::DuplicateId { line, .. } => {
                Some((*line, *line))
            }
            Self::UnknownSchema { start, end, .. } => Some((*start, *end)),
            Self::InvalidRegexp { .. } => None,
        }
    }
}
