//! Core note extraction and change-detection library for anki-sync.
//!
//! Provides:
//! - Block scanner for note documents
//! - Note builder (note type resolution, field splitting, cloze, tags, media)
//! - Change detection (content hash, note fingerprints, classification)
//! - Writeback text transform for id markers and deleted blocks
//! - Settings and the immutable per-run configuration snapshot

pub mod builder;
pub mod cloze;
pub mod config;
pub mod diagnostics;
pub mod diff;
pub mod error;
pub mod markup;
pub mod scanner;
pub mod types;
pub mod writeback;

pub use builder::{DocumentContext, Extraction, NoteBuilder};
pub use config::{
    split_tags, BuildOptions, DefaultSettings, RegexMissPolicy, RunConfig, SchemaRule, Settings,
    SyntaxConfig,
};
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diff::{
    classify, content_hash, detect_changes, fingerprint, missing_ids, needs_scan, Classification,
    ClassifiedNote, DocumentChanges, DocumentState, PendingWriteback,
};
pub use error::{NoteError, Result};
pub use scanner::{scan, ScanOutput};
pub use types::{BlockKind, BlockSource, FieldMap, Frontmatter, MediaReference, Note, RawBlock};
pub use writeback::{id_marker, strip_id_markers, Edit};
