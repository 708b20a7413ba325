//! Remote protocol collaborator: the AnkiConnect action API.
//!
//! [`AnkiApi`] is the single `invoke(action, params)` seam. [`AnkiClient`]
//! layers the typed actions the reconciler needs on top of it.

pub mod connect;
pub mod error;

pub use connect::AnkiConnect;
pub use error::RemoteError;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;

/// Protocol version sent with every request.
pub const API_VERSION: u32 = 6;

type Result<T> = std::result::Result<T, RemoteError>;

/// Per-item outcome inside a batch call.
pub type ItemResult<T> = std::result::Result<T, String>;

/// Transport for AnkiConnect actions.
pub trait AnkiApi: Send + Sync {
    /// Run one action and return its `result` value.
    fn invoke(&self, action: &str, params: Value) -> impl Future<Output = Result<Value>> + Send;
}

impl<A: AnkiApi> AnkiApi for std::sync::Arc<A> {
    fn invoke(&self, action: &str, params: Value) -> impl Future<Output = Result<Value>> + Send {
        (**self).invoke(action, params)
    }
}

/// Note payload for `addNotes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    pub deck_name: String,
    pub model_name: String,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub options: NoteOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteOptions {
    pub allow_duplicate: bool,
    pub duplicate_scope: String,
}

impl Default for NoteOptions {
    fn default() -> Self {
        Self {
            allow_duplicate: false,
            duplicate_scope: "deck".to_string(),
        }
    }
}

/// Note payload for `updateNote`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteUpdate {
    pub id: i64,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// Typed AnkiConnect actions over any [`AnkiApi`] transport.
#[derive(Debug, Clone)]
pub struct AnkiClient<A> {
    api: A,
}

impl<A: AnkiApi> AnkiClient<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, params: Value) -> Result<T> {
        let value = self.api.invoke(action, params).await?;
        serde_json::from_value(value).map_err(|e| RemoteError::Unexpected {
            action: action.to_string(),
            message: e.to_string(),
        })
    }

    /// Connectivity check; returns the protocol version the service speaks.
    pub async fn version(&self) -> Result<u32> {
        self.call("version", json!({})).await
    }

    pub async fn model_names(&self) -> Result<Vec<String>> {
        self.call("modelNames", json!({})).await
    }

    /// Field lists of every named note type, fetched in one `multi` call.
    pub async fn model_field_names(&self, models: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        let actions = models
            .iter()
            .map(|m| action("modelFieldNames", json!({ "modelName": m })))
            .collect();
        let results = self.multi(actions).await?;

        let mut table = BTreeMap::new();
        for (model, result) in models.iter().zip(results) {
            let value = result.map_err(|message| RemoteError::Action {
                action: "modelFieldNames".to_string(),
                message,
            })?;
            let fields: Vec<String> =
                serde_json::from_value(value).map_err(|e| RemoteError::Unexpected {
                    action: "modelFieldNames".to_string(),
                    message: e.to_string(),
                })?;
            table.insert(model.clone(), fields);
        }
        Ok(table)
    }

    pub async fn create_deck(&self, deck: &str) -> Result<()> {
        self.api.invoke("createDeck", json!({ "deck": deck })).await?;
        Ok(())
    }

    /// Create notes in one call, one result per input in order.
    ///
    /// When the service rejects the whole batch, the notes are retried as a
    /// `multi` of single `addNote` actions so one bad note cannot sink the
    /// others.
    pub async fn add_notes(&self, notes: &[NewNote]) -> Result<Vec<ItemResult<i64>>> {
        if notes.is_empty() {
            return Ok(Vec::new());
        }

        match self.api.invoke("addNotes", json!({ "notes": notes })).await {
            Ok(Value::Array(ids)) if ids.len() == notes.len() => Ok(ids
                .into_iter()
                .map(|id| id.as_i64().ok_or_else(|| "note was rejected".to_string()))
                .collect()),
            Ok(other) => Err(RemoteError::Unexpected {
                action: "addNotes".to_string(),
                message: format!("expected {} ids, got {}", notes.len(), other),
            }),
            Err(RemoteError::Action { .. }) => {
                let actions = notes
                    .iter()
                    .map(|n| action("addNote", json!({ "note": n })))
                    .collect();
                let results = self.multi(actions).await?;
                Ok(results
                    .into_iter()
                    .map(|r| {
                        r.and_then(|v| v.as_i64().ok_or_else(|| "note was rejected".to_string()))
                    })
                    .collect())
            }
            Err(err) => Err(err),
        }
    }

    /// Update fields and tags of existing notes, one result per input.
    pub async fn update_notes(&self, updates: &[NoteUpdate]) -> Result<Vec<ItemResult<()>>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let actions = updates
            .iter()
            .map(|u| action("updateNote", json!({ "note": u })))
            .collect();
        Ok(self
            .multi(actions)
            .await?
            .into_iter()
            .map(|r| r.map(|_| ()))
            .collect())
    }

    /// Card ids of each note. Unknown notes are absent from the map.
    pub async fn note_cards(&self, ids: &[i64]) -> Result<BTreeMap<i64, Vec<i64>>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let infos: Vec<Value> = self.call("notesInfo", json!({ "notes": ids })).await?;
        Ok(infos
            .iter()
            .filter_map(|info| {
                let id = info.get("noteId")?.as_i64()?;
                let cards = info
                    .get("cards")?
                    .as_array()?
                    .iter()
                    .filter_map(Value::as_i64)
                    .collect();
                Some((id, cards))
            })
            .collect())
    }

    pub async fn change_deck(&self, cards: &[i64], deck: &str) -> Result<()> {
        if cards.is_empty() {
            return Ok(());
        }
        self.api
            .invoke("changeDeck", json!({ "cards": cards, "deck": deck }))
            .await?;
        Ok(())
    }

    pub async fn delete_notes(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.api.invoke("deleteNotes", json!({ "notes": ids })).await?;
        Ok(())
    }

    /// Names of every file in the remote media folder.
    pub async fn media_file_names(&self) -> Result<BTreeSet<String>> {
        self.call("getMediaFilesNames", json!({ "pattern": "*" })).await
    }

    /// Upload a local file into the remote media folder.
    pub async fn store_media_file(&self, filename: &str, path: &Path) -> Result<()> {
        self.api
            .invoke(
                "storeMediaFile",
                json!({ "filename": filename, "path": path.to_string_lossy() }),
            )
            .await?;
        Ok(())
    }

    async fn multi(&self, actions: Vec<Value>) -> Result<Vec<ItemResult<Value>>> {
        let expected = actions.len();
        let results: Vec<Value> = self.call("multi", json!({ "actions": actions })).await?;
        if results.len() != expected {
            return Err(RemoteError::Unexpected {
                action: "multi".to_string(),
                message: format!("expected {} results, got {}", expected, results.len()),
            });
        }
        Ok(results.into_iter().map(multi_item).collect())
    }
}

fn action(name: &str, params: Value) -> Value {
    json!({ "action": name, "version": API_VERSION, "params": params })
}

/// Unwrap one `multi` item, which is `{result, error}` for versioned actions.
fn multi_item(value: Value) -> ItemResult<Value> {
    match value {
        Value::Object(mut map) if map.contains_key("error") || map.contains_key("result") => {
            match map.remove("error") {
                Some(Value::String(message)) => Err(message),
                Some(Value::Null) | None => Ok(map.remove("result").unwrap_or(Value::Null)),
                Some(other) => Err(other.to_string()),
            }
        }
        other => Ok(other),
    }
}
