//! Common test utilities for integration tests.
//!
//! This module provides shared test infrastructure including:
//! - FakeAnki, an in-process AnkiConnect speaking the JSON action protocol
//! - Harness, a temporary vault wired to a sync engine and an in-memory state store
//! - FlakyStore, a document store whose writes can be made to fail and whose
//!   documents can be edited between scan and writeback

pub mod fixtures;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use anki_sync_core::Settings;
use anki_sync_lib::anki::AnkiConnect;
use anki_sync_lib::db::SqliteStateStore;
use anki_sync_lib::sync::{CancelFlag, SyncEngine, SyncReport, SyncRequest};
use anki_sync_lib::vault::{DocumentHandle, DocumentStore, FsVault, HostError, Scope};

/// First id handed out by the fake service.
pub const FIRST_NOTE_ID: i64 = 1_700_000_000_000;

/// A note as the fake service stores it.
#[derive(Debug, Clone)]
pub struct FakeNote {
    pub deck: String,
    pub model: String,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl FakeNote {
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug)]
struct FakeState {
    models: BTreeMap<String, Vec<String>>,
    notes: BTreeMap<i64, FakeNote>,
    decks: BTreeSet<String>,
    media: BTreeSet<String>,
    calls: Vec<String>,
    next_id: i64,
}

/// In-memory AnkiConnect.
///
/// Any note whose first field contains `FAIL` is rejected on create and on
/// update, which lets tests provoke per-item failures.
#[derive(Debug)]
pub struct FakeAnki {
    state: Mutex<FakeState>,
    cancel_on: Mutex<Option<(String, CancelFlag)>>,
}

impl FakeAnki {
    fn new() -> Self {
        let models = BTreeMap::from([
            ("Basic".to_string(), vec!["Front".to_string(), "Back".to_string()]),
            (
                "Cloze".to_string(),
                vec!["Text".to_string(), "Back Extra".to_string()],
            ),
        ]);
        Self {
            state: Mutex::new(FakeState {
                models,
                notes: BTreeMap::new(),
                decks: BTreeSet::from(["Default".to_string()]),
                media: BTreeSet::new(),
                calls: Vec::new(),
                next_id: FIRST_NOTE_ID,
            }),
            cancel_on: Mutex::new(None),
        }
    }

    /// Start serving on an ephemeral local port; returns the service URL.
    pub async fn serve() -> (Arc<Self>, String) {
        let anki = Arc::new(Self::new());
        let app = Router::new()
            .route("/", post(handle))
            .with_state(anki.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (anki, format!("http://{}", addr))
    }

    pub fn notes(&self) -> BTreeMap<i64, FakeNote> {
        self.state.lock().unwrap().notes.clone()
    }

    pub fn note(&self, id: i64) -> Option<FakeNote> {
        self.state.lock().unwrap().notes.get(&id).cloned()
    }

    pub fn media(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().media.clone()
    }

    /// How many times `action` was invoked, including inside `multi`.
    pub fn count(&self, action: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == action)
            .count()
    }

    /// Forget the call log, keeping notes and media.
    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Set `flag` whenever `action` is handled, as if the user cancelled
    /// right after that call went through.
    pub fn cancel_on(&self, action: &str, flag: CancelFlag) {
        *self.cancel_on.lock().unwrap() = Some((action.to_string(), flag));
    }

    pub fn clear_cancel(&self) {
        *self.cancel_on.lock().unwrap() = None;
    }

    fn dispatch(&self, action: &str, params: &Value) -> Result<Value, String> {
        if action == "multi" {
            let actions = params["actions"].as_array().cloned().unwrap_or_default();
            let results = actions
                .iter()
                .map(|a| {
                    let name = a["action"].as_str().unwrap_or_default();
                    match self.dispatch(name, &a["params"]) {
                        Ok(result) => json!({ "result": result, "error": null }),
                        Err(error) => json!({ "result": null, "error": error }),
                    }
                })
                .collect();
            self.state.lock().unwrap().calls.push("multi".to_string());
            return Ok(Value::Array(results));
        }

        if let Some((trigger, flag)) = self.cancel_on.lock().unwrap().as_ref() {
            if trigger == action {
                flag.cancel();
            }
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(action.to_string());
        match action {
            "version" => Ok(json!(6)),
            "modelNames" => Ok(json!(state.models.keys().collect::<Vec<_>>())),
            "modelFieldNames" => {
                let model = params["modelName"].as_str().unwrap_or_default();
                state
                    .models
                    .get(model)
                    .map(|fields| json!(fields))
                    .ok_or_else(|| format!("model was not found: {}", model))
            }
            "createDeck" => {
                let deck = params["deck"].as_str().unwrap_or_default().to_string();
                state.decks.insert(deck);
                Ok(json!(1))
            }
            "addNotes" => {
                let notes = params["notes"].as_array().cloned().unwrap_or_default();
                let ids = notes
                    .iter()
                    .map(|n| add_note(&mut state, n).map(|id| json!(id)).unwrap_or(Value::Null))
                    .collect();
                Ok(Value::Array(ids))
            }
            "addNote" => add_note(&mut state, &params["note"]).map(|id| json!(id)),
            "updateNote" => {
                let note = &params["note"];
                let id = note["id"].as_i64().unwrap_or_default();
                let fields = string_map(&note["fields"]);
                if fields.values().any(|v| v.contains("FAIL")) {
                    return Err("cannot update note".to_string());
                }
                let stored = state
                    .notes
                    .get_mut(&id)
                    .ok_or_else(|| format!("note was not found: {}", id))?;
                stored.fields.extend(fields);
                stored.tags = string_list(&note["tags"]);
                Ok(Value::Null)
            }
            "notesInfo" => {
                let ids = params["notes"].as_array().cloned().unwrap_or_default();
                Ok(Value::Array(
                    ids.iter()
                        .filter_map(Value::as_i64)
                        .map(|id| match state.notes.get(&id) {
                            Some(note) => json!({
                                "noteId": id,
                                "modelName": note.model,
                                "tags": note.tags,
                                "cards": [id * 10],
                            }),
                            None => json!({}),
                        })
                        .collect(),
                ))
            }
            "changeDeck" => {
                let deck = params["deck"].as_str().unwrap_or_default().to_string();
                let cards: Vec<i64> = params["cards"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_i64)
                    .collect();
                state.decks.insert(deck.clone());
                for card in cards {
                    if let Some(note) = state.notes.get_mut(&(card / 10)) {
                        note.deck = deck.clone();
                    }
                }
                Ok(Value::Null)
            }
            "deleteNotes" => {
                let ids: Vec<i64> = params["notes"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_i64)
                    .collect();
                for id in ids {
                    state.notes.remove(&id);
                }
                Ok(Value::Null)
            }
            "getMediaFilesNames" => Ok(json!(state.media.iter().collect::<Vec<_>>())),
            "storeMediaFile" => {
                let filename = params["filename"].as_str().unwrap_or_default().to_string();
                state.media.insert(filename.clone());
                Ok(json!(filename))
            }
            other => Err(format!("unsupported action {}", other)),
        }
    }
}

fn add_note(state: &mut FakeState, note: &Value) -> Result<i64, String> {
    let model = note["modelName"].as_str().unwrap_or_default().to_string();
    if !state.models.contains_key(&model) {
        return Err(format!("model was not found: {}", model));
    }
    let fields = string_map(&note["fields"]);
    if fields.values().any(|v| v.contains("FAIL")) {
        return Err("cannot create note".to_string());
    }

    let id = state.next_id;
    state.next_id += 1;
    state.notes.insert(
        id,
        FakeNote {
            deck: note["deckName"].as_str().unwrap_or_default().to_string(),
            model,
            fields,
            tags: string_list(&note["tags"]),
        },
    );
    Ok(id)
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
        .collect()
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

async fn handle(State(anki): State<Arc<FakeAnki>>, Json(request): Json<Value>) -> Json<Value> {
    let action = request["action"].as_str().unwrap_or_default().to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    Json(match anki.dispatch(&action, &params) {
        Ok(result) => json!({ "result": result, "error": null }),
        Err(error) => json!({ "result": null, "error": error }),
    })
}

/// Text appended to a document on its second read, which is the re-read
/// done right before writeback.
struct ConcurrentEdit {
    path: String,
    suffix: String,
    reads: usize,
}

/// Document store over an [`FsVault`] whose writes fail while
/// `fail_writes` is set.
pub struct FlakyStore {
    inner: FsVault,
    pub fail_writes: AtomicBool,
    edit: Mutex<Option<ConcurrentEdit>>,
}

impl FlakyStore {
    pub fn new(inner: FsVault) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            edit: Mutex::new(None),
        }
    }

    /// Append `suffix` to `path` on disk after it was scanned and before the
    /// engine re-reads it for writeback.
    pub fn edit_before_writeback(&self, path: &str, suffix: &str) {
        *self.edit.lock().unwrap() = Some(ConcurrentEdit {
            path: path.to_string(),
            suffix: suffix.to_string(),
            reads: 0,
        });
    }
}

impl DocumentStore for FlakyStore {
    fn list_documents(&self, scope: &Scope) -> Result<Vec<DocumentHandle>, HostError> {
        self.inner.list_documents(scope)
    }

    fn read_text(&self, doc: &DocumentHandle) -> Result<String, HostError> {
        let mut edit = self.edit.lock().unwrap();
        if let Some(pending) = edit.as_mut().filter(|e| e.path == doc.path) {
            pending.reads += 1;
            if pending.reads == 2 {
                let text = format!("{}{}", self.inner.read_text(doc)?, pending.suffix);
                self.inner.write_text(doc, &text)?;
                *edit = None;
            }
        }
        drop(edit);
        self.inner.read_text(doc)
    }

    fn write_text(&self, doc: &DocumentHandle, text: &str) -> Result<(), HostError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HostError::NotFound(doc.path.clone()));
        }
        self.inner.write_text(doc, text)
    }

    fn media_path(&self, doc: &DocumentHandle, filename: &str) -> Option<PathBuf> {
        self.inner.media_path(doc, filename)
    }
}

/// Temporary vault, fake service and engine for one test.
pub struct Harness {
    pub dir: TempDir,
    pub anki: Arc<FakeAnki>,
    pub engine: SyncEngine<AnkiConnect>,
    pub flaky: Arc<FlakyStore>,
}

impl Harness {
    /// Create a harness with default settings.
    pub async fn new() -> Self {
        Self::with_settings(Settings::default()).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        let (anki, url) = FakeAnki::serve().await;
        Self::build(anki, &url, settings)
    }

    /// Harness whose engine points at `url` instead of a running service.
    pub async fn unreachable(url: &str) -> Self {
        Self::build(Arc::new(FakeAnki::new()), url, Settings::default())
    }

    fn build(anki: Arc<FakeAnki>, url: &str, settings: Settings) -> Self {
        let dir = TempDir::new().unwrap();
        let vault = FsVault::from_settings(dir.path(), &settings).unwrap();
        let flaky = Arc::new(FlakyStore::new(vault));
        let engine = SyncEngine::new(
            AnkiConnect::new(url),
            flaky.clone(),
            SqliteStateStore::open_in_memory().unwrap(),
            settings,
        );
        Self {
            dir,
            anki,
            engine,
            flaky,
        }
    }

    pub fn write(&self, path: &str, text: &str) {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, text).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(path)).unwrap()
    }

    /// Sync the whole vault and return the report.
    pub async fn sync(&self) -> SyncReport {
        self.engine.sync(SyncRequest::default()).await.unwrap()
    }

    pub async fn sync_forced(&self) -> SyncReport {
        self.engine
            .sync(SyncRequest {
                scope: Scope::Vault,
                force: true,
            })
            .await
            .unwrap()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.flaky.fail_writes.store(fail, Ordering::SeqCst);
    }
}
