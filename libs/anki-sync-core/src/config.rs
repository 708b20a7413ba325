//! User settings and the immutable per-run configuration snapshot.
//!
//! [`Settings`] is what the user edits and what gets persisted. At the start
//! of every run it is combined with the note types reported by the remote
//! store into a [`RunConfig`], which every later stage receives by reference
//! and never mutates.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::NoteError;

/// Default ignore pattern for drawings stored as markdown.
pub const DEFAULT_IGNORED_FILE_GLOBS: &[&str] = &["**/*.excalidraw.md"];

/// Delimiter tokens recognised by the block scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntaxConfig {
    pub begin_note: String,
    pub end_note: String,
    pub begin_inline_note: String,
    pub end_inline_note: String,
    pub target_deck_line: String,
    pub file_tags_line: String,
    pub delete_note_line: String,
    pub frozen_fields_line: String,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            begin_note: "START".to_string(),
            end_note: "END".to_string(),
            begin_inline_note: "STARTI".to_string(),
            end_inline_note: "ENDI".to_string(),
            target_deck_line: "TARGET DECK".to_string(),
            file_tags_line: "FILE TAGS".to_string(),
            delete_note_line: "DELETE".to_string(),
            frozen_fields_line: "FROZEN".to_string(),
        }
    }
}

/// What to do with a block whose custom regexp matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexMissPolicy {
    /// The block produces no notes.
    Drop,
    /// The block is split as if no regexp were configured.
    DefaultSplit,
}

impl Default for RegexMissPolicy {
    fn default() -> Self {
        Self::Drop
    }
}

/// Global defaults and feature toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultSettings {
    pub scan_directory: String,
    pub scan_tags: String,
    pub tag: String,
    pub deck: String,
    pub note_type: String,
    pub scheduling_interval: u64,
    pub add_file_link: bool,
    pub file_link_newline: bool,
    pub add_context: bool,
    pub add_aliases: bool,
    pub curly_cloze: bool,
    pub highlights_to_cloze: bool,
    pub cloze_keyword: String,
    pub id_comments: bool,
    pub add_inline_tags: bool,
    pub add_yaml_tags: bool,
    pub smart_scan: bool,
    pub regex_required_tags: bool,
    pub delete_missing_notes: bool,
    pub regex_miss_policy: RegexMissPolicy,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            scan_directory: String::new(),
            scan_tags: String::new(),
            tag: "Obsidian_to_Anki".to_string(),
            deck: "Default".to_string(),
            note_type: "Basic".to_string(),
            scheduling_interval: 0,
            add_file_link: false,
            file_link_newline: true,
            add_context: false,
            add_aliases: false,
            curly_cloze: false,
            highlights_to_cloze: false,
            cloze_keyword: "Cloze".to_string(),
            id_comments: true,
            add_inline_tags: false,
            add_yaml_tags: false,
            smart_scan: true,
            regex_required_tags: false,
            delete_missing_notes: true,
            regex_miss_policy: RegexMissPolicy::default(),
        }
    }
}

/// Complete user configuration, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub syntax: SyntaxConfig,
    pub defaults: DefaultSettings,
    /// Note type -> custom body-splitting regexp ("" = none).
    pub custom_regexps: BTreeMap<String, String>,
    /// Note type -> comma separated tags gating its custom regexp.
    pub regexp_tags: BTreeMap<String, String>,
    pub file_link_fields: BTreeMap<String, String>,
    pub context_fields: BTreeMap<String, String>,
    pub alias_fields: BTreeMap<String, String>,
    /// Folder path -> deck name.
    pub folder_decks: BTreeMap<String, String>,
    /// Folder path -> space or comma separated tags.
    pub folder_tags: BTreeMap<String, String>,
    pub ignored_file_globs: Vec<String>,
    pub vault_name: String,
    pub anki_connect_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            syntax: SyntaxConfig::default(),
            defaults: DefaultSettings::default(),
            custom_regexps: BTreeMap::new(),
            regexp_tags: BTreeMap::new(),
            file_link_fields: BTreeMap::new(),
            context_fields: BTreeMap::new(),
            alias_fields: BTreeMap::new(),
            folder_decks: BTreeMap::new(),
            folder_tags: BTreeMap::new(),
            ignored_file_globs: DEFAULT_IGNORED_FILE_GLOBS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vault_name: String::new(),
            anki_connect_url: "http://127.0.0.1:8765".to_string(),
        }
    }
}

impl Settings {
    /// Bring per-note-type maps in line with the note types the remote store
    /// currently has: add empty entries for new types, drop vanished ones,
    /// and repair field selections that no longer exist.
    pub fn reconcile_note_types(&mut self, fields: &BTreeMap<String, Vec<String>>) {
        self.custom_regexps.retain(|name, _| fields.contains_key(name));
        self.regexp_tags.retain(|name, _| fields.contains_key(name));

        for (name, field_names) in fields {
            self.custom_regexps.entry(name.clone()).or_default();
            self.regexp_tags.entry(name.clone()).or_default();

            let Some(first) = field_names.first() else {
                continue;
            };
            let link = self
                .file_link_fields
                .entry(name.clone())
                .or_insert_with(|| first.clone());
            if !field_names.contains(link) {
                *link = first.clone();
            }
            for map in [&mut self.context_fields, &mut self.alias_fields] {
                if let Some(field) = map.get_mut(name) {
                    if !field.is_empty() && !field_names.contains(field) {
                        field.clear();
                    }
                }
            }
        }
    }
}

/// Build rules for one remote note type.
#[derive(Debug, Clone)]
pub struct SchemaRule {
    pub name: String,
    pub fields: Vec<String>,
    pub split_regex: Option<Regex>,
    pub required_tags: BTreeSet<String>,
    pub file_link_field: Option<String>,
    pub context_field: Option<String>,
    pub alias_field: Option<String>,
    pub cloze: bool,
    pub id_comments: bool,
}

/// Run-wide builder options that are not tied to a single note type.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub default_schema: String,
    pub default_deck: String,
    pub global_tags: Vec<String>,
    pub folder_decks: BTreeMap<String, String>,
    pub folder_tags: BTreeMap<String, Vec<String>>,
    pub highlights_to_cloze: bool,
    pub extract_inline_tags: bool,
    pub yaml_tags: bool,
    pub regex_required_tags: bool,
    pub regex_miss_policy: RegexMissPolicy,
    pub vault_name: String,
    pub file_link_newline: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let defaults = DefaultSettings::default();
        Self {
            default_schema: defaults.note_type,
            default_deck: defaults.deck,
            global_tags: split_tags(&defaults.tag),
            folder_decks: BTreeMap::new(),
            folder_tags: BTreeMap::new(),
            highlights_to_cloze: false,
            extract_inline_tags: false,
            yaml_tags: false,
            regex_required_tags: false,
            regex_miss_policy: RegexMissPolicy::default(),
            vault_name: String::new(),
            file_link_newline: true,
        }
    }
}

/// Immutable configuration snapshot for a single sync run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub syntax: SyntaxConfig,
    pub schemas: BTreeMap<String, SchemaRule>,
    pub options: BuildOptions,
    pub smart_scan: bool,
    pub delete_missing: bool,
}

impl RunConfig {
    /// Freeze `settings` against the remote note-type table.
    ///
    /// Custom regexps that fail to compile are reported and ignored.
    pub fn new(
        settings: &Settings,
        fields: &BTreeMap<String, Vec<String>>,
    ) -> (Self, Vec<Diagnostic>) {
        let defaults = &settings.defaults;
        let mut diagnostics = Vec::new();
        let mut schemas = BTreeMap::new();

        for (name, field_names) in fields {
            let split_regex = match settings.custom_regexps.get(name) {
                Some(pattern) if !pattern.trim().is_empty() => {
                    match compile_split_regex(name, pattern) {
                        Ok(re) => Some(re),
                        Err(err) => {
                            diagnostics.push(Diagnostic::from_note_error(&err, None));
                            None
                        }
                    }
                }
                _ => None,
            };

            let required_tags = settings
                .regexp_tags
                .get(name)
                .map(|tags| split_tags(tags).into_iter().collect())
                .unwrap_or_default();

            let pick = |map: &BTreeMap<String, String>| -> Option<String> {
                map.get(name)
                    .filter(|f| !f.is_empty() && field_names.contains(f))
                    .cloned()
            };

            let file_link_field = if defaults.add_file_link {
                pick(&settings.file_link_fields).or_else(|| field_names.first().cloned())
            } else {
                None
            };
            let context_field = if defaults.add_context {
                pick(&settings.context_fields)
            } else {
                None
            };
            let alias_field = if defaults.add_aliases {
                pick(&settings.alias_fields)
            } else {
                None
            };

            let cloze = defaults.curly_cloze
                && !defaults.cloze_keyword.is_empty()
                && name.contains(&defaults.cloze_keyword);

            schemas.insert(
                name.clone(),
                SchemaRule {
                    name: name.clone(),
                    fields: field_names.clone(),
                    split_regex,
                    required_tags,
                    file_link_field,
                    context_field,
                    alias_field,
                    cloze,
                    id_comments: defaults.id_comments,
                },
            );
        }

        let options = BuildOptions {
            default_schema: defaults.note_type.clone(),
            default_deck: defaults.deck.clone(),
            global_tags: split_tags(&defaults.tag),
            folder_decks: settings
                .folder_decks
                .iter()
                .filter(|(_, deck)| !deck.trim().is_empty())
                .map(|(folder, deck)| (normalize_folder(folder), deck.trim().to_string()))
                .collect(),
            folder_tags: settings
                .folder_tags
                .iter()
                .map(|(folder, tags)| (normalize_folder(folder), split_tags(tags)))
                .filter(|(_, tags)| !tags.is_empty())
                .collect(),
            highlights_to_cloze: defaults.highlights_to_cloze,
            extract_inline_tags: defaults.add_inline_tags,
            yaml_tags: defaults.add_yaml_tags,
            regex_required_tags: defaults.regex_required_tags,
            regex_miss_policy: defaults.regex_miss_policy,
            vault_name: settings.vault_name.clone(),
            file_link_newline: defaults.file_link_newline,
        };

        let config = Self {
            syntax: settings.syntax.clone(),
            schemas,
            options,
            smart_scan: defaults.smart_scan,
            delete_missing: defaults.delete_missing_notes,
        };
        (config, diagnostics)
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaRule> {
        self.schemas.get(name)
    }

    /// Deck for a document in `folder`: longest matching folder prefix, else
    /// the global default.
    pub fn folder_deck(&self, folder: &str) -> &str {
        longest_prefix(&self.options.folder_decks, folder)
            .map(String::as_str)
            .unwrap_or(&self.options.default_deck)
    }

    /// Tags configured for the longest matching folder prefix.
    pub fn folder_tags(&self, folder: &str) -> &[String] {
        longest_prefix(&self.options.folder_tags, folder)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn compile_split_regex(schema: &str, pattern: &str) -> Result<Regex, NoteError> {
    regex::RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|e| NoteError::InvalidRegexp {
            schema: schema.to_string(),
            message: e.to_string(),
        })
}

fn normalize_folder(folder: &str) -> String {
    folder.trim().trim_matches('/').to_string()
}

fn longest_prefix<'a, V>(map: &'a BTreeMap<String, V>, folder: &str) -> Option<&'a V> {
    let folder = folder.trim_matches('/');
    map.iter()
        .filter(|(prefix, _)| {
            prefix.is_empty()
                || folder == prefix.as_str()
                || folder
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, value)| value)
}

/// Split a tag list separated by commas and/or whitespace.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(|t| t.trim().trim_start_matches('#'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
