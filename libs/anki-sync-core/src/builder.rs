//! Note builder: turns raw blocks into canonical, schema-bound notes.
//!
//! Each block is resolved to a note type, split into one or more field sets,
//! passed through the enabled transforms (cloze, inline tags, media,
//! context/alias/file-link injection) and finally fingerprinted.

use std::collections::BTreeSet;

use crate::cloze::{curly_to_cloze, highest_cloze_index, highlights_to_braces};
use crate::config::{RegexMissPolicy, RunConfig, SchemaRule};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::diff::fingerprint;
use crate::error::{NoteError, Result};
use crate::markup::{breadcrumb, file_link, parse_frontmatter, MediaScanner, Outline, TagExtractor};
use crate::scanner::scan;
use crate::types::{BlockKind, FieldMap, Frontmatter, MediaReference, Note, RawBlock};

/// What the builder knows about the document a block came from.
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    /// Vault-relative path with `/` separators.
    pub path: String,
    /// Containing folder, empty at the vault root.
    pub folder: String,
    pub frontmatter: Frontmatter,
    pub outline: Outline,
}

impl DocumentContext {
    pub fn new(path: impl Into<String>, content: &str) -> Self {
        let path = path.into();
        let folder = path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();
        Self {
            path,
            folder,
            frontmatter: parse_frontmatter(content).unwrap_or_default(),
            outline: Outline::parse(content),
        }
    }
}

/// Notes and diagnostics produced from one document.
#[derive(Debug, Default)]
pub struct Extraction {
    pub notes: Vec<Note>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Field set after the content transforms, before injection.
struct Rendered {
    fields: FieldMap,
    tags: Vec<String>,
    media: Vec<MediaReference>,
}

/// Builds notes against one run's configuration.
pub struct NoteBuilder<'c> {
    config: &'c RunConfig,
    tag_extractor: TagExtractor,
    media: MediaScanner,
}

impl<'c> NoteBuilder<'c> {
    pub fn new(config: &'c RunConfig) -> Self {
        Self {
            config,
            tag_extractor: TagExtractor::new(),
            media: MediaScanner::new(),
        }
    }

    /// Scan `content` and build every block found in it.
    ///
    /// Dropped blocks are reported as diagnostics; they never fail the document.
    pub fn extract(&self, content: &str, doc: &DocumentContext) -> Extraction {
        let scanned = scan(content, &self.config.syntax);
        let mut out = Extraction::default();

        for err in &scanned.errors {
            out.diagnostics
                .push(Diagnostic::from_note_error(err, Some(&doc.path)));
        }
        for block in &scanned.blocks {
            match self.build(block, doc, &mut out.diagnostics) {
                Ok(notes) => out.notes.extend(notes),
                Err(err) => out
                    .diagnostics
                    .push(Diagnostic::from_note_error(&err, Some(&doc.path))),
            }
        }
        out
    }

    /// Build the notes of a single block.
    ///
    /// Non-fatal problems are pushed to `diagnostics`.
    pub fn build(
        &self,
        block: &RawBlock,
        doc: &DocumentContext,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<Note>> {
        let options = &self.config.options;

        // 1. Note type
        let (rule, body) = self.resolve_schema(block)?;

        // 2. Split and transform, once with frozen text and once without
        let mut doc_tags: BTreeSet<String> = block.tags.iter().flatten().cloned().collect();
        let gate_tags: BTreeSet<String> = doc_tags
            .iter()
            .chain(&doc.frontmatter.tags)
            .cloned()
            .collect();
        if options.yaml_tags {
            doc_tags.extend(doc.frontmatter.tags.iter().cloned());
        }

        let full_text = match &block.frozen {
            Some(frozen) => format!("{body}\n{frozen}"),
            None => body.clone(),
        };
        let rendered = self.render(rule, block.kind(), &full_text, &gate_tags);
        // The n-th unfrozen field set fingerprints the n-th candidate, which
        // only holds while both renders split the same way.
        let mut stable = match block.frozen {
            Some(_) => {
                let unfrozen = self.render(rule, block.kind(), &body, &gate_tags);
                if unfrozen.len() == rendered.len() {
                    Some(unfrozen.into_iter())
                } else {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticKind::FrozenSplit,
                            format!(
                                "frozen text splits the block into {} notes instead of {}",
                                rendered.len(),
                                unfrozen.len()
                            ),
                        )
                        .with_path(&doc.path)
                        .with_lines(block.lines()),
                    );
                    None
                }
            }
            None => None,
        };

        // 3. Deck
        let deck = block
            .deck
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| self.config.folder_deck(&doc.folder))
            .to_string();

        let mut notes = Vec::new();
        for candidate in rendered {
            let unfrozen = stable.as_mut().and_then(|s| s.next());
            let id = block.ids.get(notes.len()).copied();
            if candidate.fields.is_blank() && !(block.delete && id.is_some()) {
                continue;
            }

            // 4. Tags
            let tags: BTreeSet<String> = options
                .global_tags
                .iter()
                .chain(self.config.folder_tags(&doc.folder))
                .chain(&doc_tags)
                .chain(&candidate.tags)
                .map(|t| t.trim().replace(' ', "_"))
                .filter(|t| !t.is_empty())
                .collect();

            // 5. Injection and fingerprint
            let mut fields = candidate.fields;
            self.inject(rule, &mut fields, block, doc);
            let fingerprint = match unfrozen {
                Some(mut unfrozen) => {
                    self.inject(rule, &mut unfrozen.fields, block, doc);
                    fingerprint(&rule.name, &deck, &tags, &unfrozen.fields)
                }
                None => fingerprint(&rule.name, &deck, &tags, &fields),
            };

            notes.push(Note {
                schema: rule.name.clone(),
                fields,
                tags,
                deck: deck.clone(),
                id,
                fingerprint,
                media: candidate.media,
                delete: block.delete,
                id_comment: rule.id_comments,
                index_in_block: notes.len(),
                source: block.source.clone(),
            });
        }

        Ok(notes)
    }

    /// Pick the block's note type and return the body with any bare type
    /// line removed.
    fn resolve_schema(&self, block: &RawBlock) -> Result<(&SchemaRule, String)> {
        let (start, end) = block.lines();
        let unknown = |name: &str| NoteError::UnknownSchema {
            name: name.to_string(),
            start,
            end,
        };

        if let Some(name) = &block.schema {
            let rule = self.config.schema(name).ok_or_else(|| unknown(name))?;
            return Ok((rule, block.body.clone()));
        }

        if block.kind() == BlockKind::Regular {
            let first = block
                .body
                .lines()
                .enumerate()
                .find(|(_, line)| !line.trim().is_empty());
            if let Some((idx, line)) = first {
                if let Some(rule) = self.config.schema(line.trim()) {
                    let rest = block
                        .body
                        .lines()
                        .skip(idx + 1)
                        .collect::<Vec<_>>()
                        .join("\n");
                    return Ok((rule, rest));
                }
            }
        }

        let default = &self.config.options.default_schema;
        let rule = self.config.schema(default).ok_or_else(|| unknown(default))?;
        Ok((rule, block.body.clone()))
    }

    fn render(
        &self,
        rule: &SchemaRule,
        kind: BlockKind,
        text: &str,
        gate_tags: &BTreeSet<String>,
    ) -> Vec<Rendered> {
        self.split(rule, kind, text, gate_tags)
            .into_iter()
            .map(|values| self.transform(rule, values))
            .collect()
    }

    fn split(
        &self,
        rule: &SchemaRule,
        kind: BlockKind,
        text: &str,
        gate_tags: &BTreeSet<String>,
    ) -> Vec<Vec<String>> {
        let options = &self.config.options;

        if let Some(re) = &rule.split_regex {
            let gated = options.regex_required_tags
                && !rule.required_tags.is_empty()
                && rule.required_tags.is_disjoint(gate_tags);
            if !gated {
                let matches: Vec<Vec<String>> = re
                    .captures_iter(text)
                    .map(|caps| {
                        if caps.len() == 1 {
                            return vec![caps[0].to_string()];
                        }
                        (1..caps.len())
                            .map(|i| caps.get(i).map_or("", |m| m.as_str()).to_string())
                            .collect()
                    })
                    .collect();
                if !matches.is_empty() || options.regex_miss_policy == RegexMissPolicy::Drop {
                    return matches;
                }
            }
        }

        let values = split_by_prefixes(rule, kind, text)
            .unwrap_or_else(|| default_split(rule, text));
        vec![values]
    }

    fn transform(&self, rule: &SchemaRule, values: Vec<String>) -> Rendered {
        let options = &self.config.options;
        // New clozes are numbered after any the note already has, in any field.
        let mut cloze_counter = values
            .iter()
            .map(|v| highest_cloze_index(v))
            .max()
            .unwrap_or(0);
        let mut fields = FieldMap::with_values(&rule.fields, values);
        let mut tags = Vec::new();
        let mut media: Vec<MediaReference> = Vec::new();

        for value in fields.values_mut() {
            let mut text = std::mem::take(value);
            if rule.cloze {
                if options.highlights_to_cloze {
                    text = highlights_to_braces(&text);
                }
                text = curly_to_cloze(&text, &mut cloze_counter);
            }
            if options.extract_inline_tags {
                let (cleaned, found) = self.tag_extractor.extract(&text);
                text = cleaned;
                tags.extend(found);
            }
            let (text, refs) = self.media.rewrite(&text);
            for reference in refs {
                if !media.contains(&reference) {
                    media.push(reference);
                }
            }
            *value = normalize(&text);
        }

        Rendered {
            fields,
            tags,
            media,
        }
    }

    fn inject(&self, rule: &SchemaRule, fields: &mut FieldMap, block: &RawBlock, doc: &DocumentContext) {
        if let Some(field) = &rule.context_field {
            let headings = doc.outline.path_at(block.source.span.start);
            fields.append(field, &breadcrumb(&doc.path, &headings), "\n");
        }
        if let Some(field) = &rule.alias_field {
            if !doc.frontmatter.aliases.is_empty() {
                fields.append(field, &doc.frontmatter.aliases.join(", "), "\n");
            }
        }
        if let Some(field) = &rule.file_link_field {
            let sep = if self.config.options.file_link_newline {
                "\n"
            } else {
                " "
            };
            let link = file_link(&self.config.options.vault_name, &doc.path);
            fields.append(field, &link, sep);
        }
    }
}

/// Split on `Field:` prefixes for every field after the first.
///
/// Returns `None` when no prefix occurs in the text.
fn split_by_prefixes(rule: &SchemaRule, kind: BlockKind, text: &str) -> Option<Vec<String>> {
    let mut values = vec![String::new(); rule.fields.len()];
    let mut current = 0;
    let mut seen = false;

    match kind {
        BlockKind::Regular => {
            for line in text.lines() {
                match line_prefix(rule, line) {
                    Some((idx, rest)) => {
                        current = idx;
                        seen = true;
                        push_line(&mut values[current], rest.trim_start());
                    }
                    None => push_line(values.get_mut(current)?, line),
                }
            }
        }
        BlockKind::Inline => {
            let mut rest = text;
            while let Some((pos, idx, len)) = inline_prefix(rule, rest) {
                values.get_mut(current)?.push_str(rest[..pos].trim());
                current = idx;
                seen = true;
                rest = &rest[pos + len..];
            }
            values.get_mut(current)?.push_str(rest.trim());
        }
    }

    seen.then_some(values)
}

fn line_prefix<'l>(rule: &SchemaRule, line: &'l str) -> Option<(usize, &'l str)> {
    rule.fields.iter().enumerate().skip(1).find_map(|(idx, name)| {
        line.strip_prefix(name.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|rest| (idx, rest))
    })
}

/// Earliest ` Field:` occurrence as (position, field index, token length).
fn inline_prefix(rule: &SchemaRule, text: &str) -> Option<(usize, usize, usize)> {
    rule.fields
        .iter()
        .enumerate()
        .skip(1)
        .filter_map(|(idx, name)| {
            let token = format!(" {name}:");
            text.find(&token).map(|pos| (pos, idx, token.len()))
        })
        .min_by_key(|(pos, _, _)| *pos)
}

fn push_line(value: &mut String, line: &str) {
    if !value.is_empty() {
        value.push('\n');
    }
    value.push_str(line);
}

/// First non-blank line to the first field, the remainder to the second.
fn default_split(rule: &SchemaRule, text: &str) -> Vec<String> {
    if rule.fields.len() <= 1 {
        return vec![text.to_string()];
    }
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());
    let first = lines.next().unwrap_or_default().to_string();
    let rest = lines.collect::<Vec<_>>().join("\n");
    vec![first, rest]
}

/// Strip trailing whitespace per line and surrounding blank lines.
fn normalize(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let start = lines
        .iter()
        .position(|l| !l.is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.is_empty())
        .map_or(start, |i| i + 1);
    lines[start..end].join("\n")
}
