//! SQLite schema for the persisted sync state.

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

pub const SCHEMA: &str = r#"
-- Content hash of each document's last clean pass
CREATE TABLE IF NOT EXISTS documents (
    path TEXT PRIMARY KEY,
    content_hash TEXT
);

-- Note ids last observed per document
CREATE TABLE IF NOT EXISTS document_notes (
    path TEXT NOT NULL,
    note_id INTEGER NOT NULL,
    PRIMARY KEY (path, note_id)
);

-- Fingerprint last submitted for each note
CREATE TABLE IF NOT EXISTS note_fingerprints (
    note_id INTEGER PRIMARY KEY,
    fingerprint TEXT NOT NULL
);

-- Media files known to exist remotely
CREATE TABLE IF NOT EXISTS media_files (
    filename TEXT PRIMARY KEY
);

-- Confirmed creates whose id marker is not yet in the document
CREATE TABLE IF NOT EXISTS pending_writebacks (
    note_id INTEGER PRIMARY KEY,
    path TEXT NOT NULL,
    fingerprint TEXT NOT NULL
);

-- Run metadata
CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_sync_at TEXT
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE INDEX IF NOT EXISTS idx_document_notes_note ON document_notes(note_id);
CREATE INDEX IF NOT EXISTS idx_pending_writebacks_path ON pending_writebacks(path);
"#;

/// Initialize run metadata if not exists.
pub const INIT_SYNC_STATE: &str = r#"
INSERT OR IGNORE INTO sync_state (id) VALUES (1);
"#;
