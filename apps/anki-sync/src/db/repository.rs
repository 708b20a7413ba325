//! Repository pattern for the persisted sync state.
//!
//! The state is read once at run start and written once at run end as a
//! whole [`StateSnapshot`], inside a single transaction.

use anki_sync_core::{DocumentState, PendingWriteback};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::db::error::DbError;

type Result<T> = std::result::Result<T, DbError>;

/// Everything the engine remembers between runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub documents: BTreeMap<String, DocumentState>,
    /// Fingerprint last submitted per note id.
    pub fingerprints: BTreeMap<i64, String>,
    /// Media filenames known to exist remotely.
    pub media: BTreeSet<String>,
    pub pending: Vec<PendingWriteback>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn document(&self, path: &str) -> Option<&DocumentState> {
        self.documents.get(path)
    }

    pub fn document_mut(&mut self, path: &str) -> &mut DocumentState {
        self.documents.entry(path.to_string()).or_default()
    }

    /// Record a confirmed create whose marker is not yet written.
    pub fn add_pending(&mut self, path: &str, fingerprint: &str, id: i64) {
        self.pending.retain(|p| p.id != id);
        self.pending.push(PendingWriteback {
            path: path.to_string(),
            fingerprint: fingerprint.to_string(),
            id,
        });
    }

    pub fn clear_pending(&mut self, id: i64) {
        self.pending.retain(|p| p.id != id);
    }

    pub fn has_pending(&self, path: &str) -> bool {
        self.pending.iter().any(|p| p.path == path)
    }

    /// Drop every trace of a note that no longer exists remotely.
    pub fn forget_note(&mut self, id: i64) {
        self.fingerprints.remove(&id);
        self.clear_pending(id);
        for doc in self.documents.values_mut() {
            doc.ids.remove(&id);
        }
    }

    /// Drop fingerprints of notes that no document or pending writeback
    /// still refers to.
    pub fn prune_fingerprints(&mut self) {
        let live: BTreeSet<i64> = self
            .documents
            .values()
            .flat_map(|doc| doc.ids.iter().copied())
            .chain(self.pending.iter().map(|p| p.id))
            .collect();
        self.fingerprints.retain(|id, _| live.contains(id));
    }

    /// Ids tracked for any document other than `except`.
    pub fn ids_outside<'a>(&'a self, except: &'a BTreeSet<String>) -> impl Iterator<Item = i64> + 'a {
        self.documents
            .iter()
            .filter(move |(path, _)| !except.contains(*path))
            .flat_map(|(_, doc)| doc.ids.iter().copied())
    }
}

/// Repository for the sync state snapshot.
pub trait StateRepository {
    fn load_snapshot(&self) -> Result<StateSnapshot>;
    fn save_snapshot(&mut self, snapshot: &StateSnapshot) -> Result<()>;
}

/// SQLite implementation of [`StateRepository`].
pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    /// Open database at path, creating if necessary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    /// Open in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(super::schema::SCHEMA)?;
        self.conn.execute_batch(super::schema::INIT_SYNC_STATE)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![super::schema::SCHEMA_VERSION],
        )?;
        Ok(())
    }
}

impl StateRepository for SqliteStateStore {
    fn load_snapshot(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::default();

        let mut stmt = self
            .conn
            .prepare("SELECT path, content_hash FROM documents")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (path, hash) = row?;
            snapshot.document_mut(&path).hash = hash;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT path, note_id FROM document_notes")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (path, id) = row?;
            snapshot.document_mut(&path).ids.insert(id);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT note_id, fingerprint FROM note_fingerprints")?;
        snapshot.fingerprints = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = self.conn.prepare("SELECT filename FROM media_files")?;
        snapshot.media = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT path, fingerprint, note_id FROM pending_writebacks ORDER BY note_id",
        )?;
        snapshot.pending = stmt
            .query_map([], |row| {
                Ok(PendingWriteback {
                    path: row.get(0)?,
                    fingerprint: row.get(1)?,
                    id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        let last: Option<String> = self.conn.query_row(
            "SELECT last_sync_at FROM sync_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        snapshot.last_sync_at = last
            .map(|ts| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| DbError::InvalidData(format!("last_sync_at: {}", e)))
            })
            .transpose()?;

        Ok(snapshot)
    }

    fn save_snapshot(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute_batch(
            "DELETE FROM documents;
             DELETE FROM document_notes;
             DELETE FROM note_fingerprints;
             DELETE FROM media_files;
             DELETE FROM pending_writebacks;",
        )?;

        {
            let mut doc_stmt =
                tx.prepare("INSERT INTO documents (path, content_hash) VALUES (?1, ?2)")?;
            let mut note_stmt =
                tx.prepare("INSERT INTO document_notes (path, note_id) VALUES (?1, ?2)")?;
            for (path, doc) in &snapshot.documents {
                doc_stmt.execute(params![path, doc.hash])?;
                for id in &doc.ids {
                    note_stmt.execute(params![path, id])?;
                }
            }

            let mut stmt = tx
                .prepare("INSERT INTO note_fingerprints (note_id, fingerprint) VALUES (?1, ?2)")?;
            for (id, fingerprint) in &snapshot.fingerprints {
                stmt.execute(params![id, fingerprint])?;
            }

            let mut stmt = tx.prepare("INSERT INTO media_files (filename) VALUES (?1)")?;
            for filename in &snapshot.media {
                stmt.execute(params![filename])?;
            }

            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO pending_writebacks (note_id, path, fingerprint)
                 VALUES (?1, ?2, ?3)",
            )?;
            for pending in &snapshot.pending {
                stmt.execute(params![pending.id, pending.path, pending.fingerprint])?;
            }
        }

        tx.execute(
            "UPDATE sync_state SET last_sync_at = ?1 WHERE id = 1",
            params![snapshot.last_sync_at.map(|dt| dt.to_rfc3339())],
        )?;

        tx.commit()?;
        Ok(())
    }
}
