//! Block scanner for note documents.
//!
//! # Format
//! ```markdown
//! TARGET DECK: Rust
//!
//! START
//! [Basic]
//! What is ownership?
//! Back: Each value has exactly one owner.
//! <!--ID: 1700000000000-->
//! END
//!
//! Inline notes live inside prose: STARTI [Basic] Front text Back: back text ENDI
//! ```
//!
//! The scanner is a line-driven state machine with two states, outside and
//! inside a regular block. Inline blocks are only recognised outside regular
//! blocks, and a begin token inside an open block is plain text.

use regex::Regex;

use crate::config::{split_tags, SyntaxConfig};
use crate::error::NoteError;
use crate::types::{BlockKind, BlockSource, RawBlock};

/// Result of scanning one document.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub blocks: Vec<RawBlock>,
    /// Blocks that were dropped, one error each.
    pub errors: Vec<NoteError>,
}

/// Scan document text into raw note blocks.
pub fn scan(content: &str, syntax: &SyntaxConfig) -> ScanOutput {
    let mut scanner = Scanner::new(syntax);
    let mut offset = 0;

    for (idx, raw) in content.split_inclusive('\n').enumerate() {
        let line = raw.trim_end_matches(['\n', '\r']);
        scanner.process_line(line, idx + 1, offset, raw.len());
        offset += raw.len();
    }

    scanner.finalize()
}

/// Matches a whole-line id marker, plain or comment wrapped.
pub(crate) fn id_line_regex() -> Regex {
    Regex::new(r"^\s*(?:<!--\s*ID:\s*(\d+)\s*-->|ID:\s*(\d+))\s*$").expect("valid id regex")
}

fn trailing_id_regex() -> Regex {
    Regex::new(r"(?:<!--\s*ID:\s*(\d+)\s*-->|\bID:\s*(\d+))\s*$").expect("valid id regex")
}

fn schema_prefix_regex() -> Regex {
    Regex::new(r"^\s*\[([^\[\]]+)\]\s*").expect("valid schema regex")
}

fn captured_id(caps: &regex::Captures<'_>) -> Option<i64> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    FileDeck,
    FileTags,
    BlockDeck,
    BlockTags,
}

struct BlockBuilder {
    start_line: usize,
    start_offset: usize,
    body: Vec<String>,
    frozen: Option<Vec<String>>,
    deck: Option<String>,
    tags: Option<Vec<String>>,
    ids: Vec<i64>,
    delete: bool,
}

impl BlockBuilder {
    fn new(start_line: usize, start_offset: usize) -> Self {
        Self {
            start_line,
            start_offset,
            body: Vec::new(),
            frozen: None,
            deck: None,
            tags: None,
            ids: Vec::new(),
            delete: false,
        }
    }

    fn push_text(&mut self, line: &str) {
        match self.frozen.as_mut() {
            Some(frozen) => frozen.push(line.to_string()),
            None => self.body.push(line.to_string()),
        }
    }
}

enum LineType<'a> {
    Begin,
    End,
    Deck(&'a str),
    Tags(&'a str),
    Delete,
    Frozen,
    Id(i64),
    Text(&'a str),
    Empty,
}

struct Scanner<'a> {
    syntax: &'a SyntaxConfig,
    id_line: Regex,
    trailing_id: Regex,
    schema_prefix: Regex,
    current: Option<BlockBuilder>,
    pending: Option<Pending>,
    file_deck: Option<String>,
    file_tags: Option<Vec<String>>,
    output: ScanOutput,
}

impl<'a> Scanner<'a> {
    fn new(syntax: &'a SyntaxConfig) -> Self {
        Self {
            syntax,
            id_line: id_line_regex(),
            trailing_id: trailing_id_regex(),
            schema_prefix: schema_prefix_regex(),
            current: None,
            pending: None,
            file_deck: None,
            file_tags: None,
            output: ScanOutput::default(),
        }
    }

    fn process_line(&mut self, line: &str, line_num: usize, offset: usize, raw_len: usize) {
        let line_type = self.parse_line(line);

        if let Some(pending) = self.pending {
            match line_type {
                LineType::Empty => return,
                LineType::Text(value) => {
                    self.pending = None;
                    self.apply_value(pending, value.trim());
                    return;
                }
                _ => self.pending = None,
            }
        }

        if self.current.is_some() {
            self.process_block_line(line_type, line_num, offset, raw_len);
        } else {
            self.process_outside_line(line, line_type, line_num, offset);
        }
    }

    fn parse_line<'l>(&self, line: &'l str) -> LineType<'l> {
        let trimmed = line.trim();
        let syntax = self.syntax;

        if trimmed.is_empty() {
            LineType::Empty
        } else if trimmed == syntax.begin_note {
            LineType::Begin
        } else if trimmed == syntax.end_note {
            LineType::End
        } else if trimmed == syntax.delete_note_line {
            LineType::Delete
        } else if trimmed == syntax.frozen_fields_line {
            LineType::Frozen
        } else if let Some(rest) = strip_token(trimmed, &syntax.target_deck_line) {
            LineType::Deck(rest)
        } else if let Some(rest) = strip_token(trimmed, &syntax.file_tags_line) {
            LineType::Tags(rest)
        } else if let Some(id) = self.id_line.captures(trimmed).and_then(|c| captured_id(&c)) {
            LineType::Id(id)
        } else {
            LineType::Text(line)
        }
    }

    fn apply_value(&mut self, pending: Pending, value: &str) {
        match pending {
            Pending::FileDeck => self.file_deck = Some(value.to_string()),
            Pending::FileTags => self.file_tags = Some(split_tags(value)),
            Pending::BlockDeck => {
                if let Some(block) = self.current.as_mut() {
                    block.deck = Some(value.to_string());
                }
            }
            Pending::BlockTags => {
                if let Some(block) = self.current.as_mut() {
                    block.tags = Some(split_tags(value));
                }
            }
        }
    }

    fn process_block_line(
        &mut self,
        line_type: LineType<'_>,
        line_num: usize,
        offset: usize,
        raw_len: usize,
    ) {
        let Some(block) = self.current.as_mut() else {
            return;
        };

        match line_type {
            LineType::End => {
                if let Some(block) = self.current.take() {
                    self.close_block(block, line_num, offset, offset + raw_len);
                }
            }
            LineType::Deck(rest) if rest.is_empty() => self.pending = Some(Pending::BlockDeck),
            LineType::Deck(rest) => block.deck = Some(rest.to_string()),
            LineType::Tags(rest) if rest.is_empty() => self.pending = Some(Pending::BlockTags),
            LineType::Tags(rest) => block.tags = Some(split_tags(rest)),
            LineType::Delete => block.delete = true,
            LineType::Frozen => {
                if block.frozen.is_none() {
                    block.frozen = Some(Vec::new());
                }
            }
            LineType::Id(id) => block.ids.push(id),
            // A nested begin token is ordinary text.
            LineType::Begin => block.push_text(&self.syntax.begin_note),
            LineType::Text(text) => block.push_text(text),
            LineType::Empty => block.push_text(""),
        }
    }

    fn process_outside_line(
        &mut self,
        line: &str,
        line_type: LineType<'_>,
        line_num: usize,
        offset: usize,
    ) {
        match line_type {
            LineType::Begin => self.current = Some(BlockBuilder::new(line_num, offset)),
            LineType::Deck(rest) if rest.is_empty() => self.pending = Some(Pending::FileDeck),
            LineType::Deck(rest) => self.file_deck = Some(rest.to_string()),
            LineType::Tags(rest) if rest.is_empty() => self.pending = Some(Pending::FileTags),
            LineType::Tags(rest) => self.file_tags = Some(split_tags(rest)),
            LineType::Text(_) => self.scan_inline(line, line_num, offset),
            _ => {}
        }
    }

    fn close_block(&mut self, block: BlockBuilder, end_line: usize, end_offset: usize, stop: usize) {
        let mut body = block.body;
        let mut schema = None;

        if let Some(first) = body.iter().position(|l| !l.trim().is_empty()) {
            let name = self
                .schema_prefix
                .captures(&body[first])
                .filter(|caps| caps[0].len() == body[first].len())
                .map(|caps| caps[1].trim().to_string());
            if name.is_some() {
                schema = name;
                body.remove(first);
            }
        }

        let body = body.join("\n");
        let frozen = block.frozen.map(|lines| lines.join("\n"));
        let empty = body.trim().is_empty()
            && frozen.as_deref().map_or(true, |f| f.trim().is_empty());

        if empty && !(block.delete && !block.ids.is_empty()) {
            return;
        }

        self.output.blocks.push(RawBlock {
            source: BlockSource {
                kind: BlockKind::Regular,
                lines: (block.start_line, end_line),
                span: block.start_offset..stop,
                id_insert_at: end_offset,
            },
            body,
            frozen,
            schema,
            deck: block.deck.or_else(|| self.file_deck.clone()),
            tags: block.tags.or_else(|| self.file_tags.clone()),
            ids: block.ids,
            delete: block.delete,
        });
    }

    fn scan_inline(&mut self, line: &str, line_num: usize, line_offset: usize) {
        let begin = self.syntax.begin_inline_note.as_str();
        let end = self.syntax.end_inline_note.as_str();
        if begin.is_empty() || end.is_empty() {
            return;
        }

        let mut cursor = 0;
        while let Some(start) = find_token(line, begin, cursor) {
            let body_start = start + begin.len();
            let Some(body_end) = find_token(line, end, body_start) else {
                self.output
                    .errors
                    .push(NoteError::UnterminatedBlock { line: line_num });
                return;
            };
            let stop = body_end + end.len();
            self.push_inline(
                &line[body_start..body_end],
                line_num,
                line_offset + start..line_offset + stop,
                line_offset + body_end,
            );
            cursor = stop;
        }
    }

    fn push_inline(
        &mut self,
        raw_body: &str,
        line_num: usize,
        span: std::ops::Range<usize>,
        id_insert_at: usize,
    ) {
        let mut body = raw_body.trim();
        let mut schema = None;
        if let Some(caps) = self.schema_prefix.captures(body) {
            schema = Some(caps[1].trim().to_string());
            body = &body[caps[0].len()..];
        }

        let mut ids = Vec::new();
        while let Some(caps) = self.trailing_id.captures(body) {
            let Some(whole) = caps.get(0) else { break };
            if let Some(id) = captured_id(&caps) {
                ids.push(id);
            }
            body = body[..whole.start()].trim_end();
        }
        ids.reverse();
        let mut body = body.to_string();

        let mut delete = false;
        let delete_token = self.syntax.delete_note_line.as_str();
        if !delete_token.is_empty() {
            if let Some(rest) = body.strip_suffix(delete_token) {
                if rest.is_empty() || rest.ends_with(char::is_whitespace) {
                    delete = true;
                    body = rest.trim_end().to_string();
                }
            }
        }

        self.output.blocks.push(RawBlock {
            source: BlockSource {
                kind: BlockKind::Inline,
                lines: (line_num, line_num),
                span,
                id_insert_at,
            },
            body,
            frozen: None,
            schema,
            deck: self.file_deck.clone(),
            tags: self.file_tags.clone(),
            ids,
            delete,
        });
    }

    fn finalize(mut self) -> ScanOutput {
        if let Some(block) = self.current.take() {
            self.output.errors.push(NoteError::UnterminatedBlock {
                line: block.start_line,
            });
        }
        self.output
    }
}

/// Strip a line-leading token, returning the remainder without a separating `:`.
fn strip_token<'l>(line: &'l str, token: &str) -> Option<&'l str> {
    if token.is_empty() {
        return None;
    }
    let rest = line.strip_prefix(token)?;
    if !(rest.is_empty() || rest.starts_with(':') || rest.starts_with(char::is_whitespace)) {
        return None;
    }
    Some(rest.trim_start_matches(':').trim())
}

/// Find `token` at or after `from`, not glued to surrounding word characters.
fn find_token(haystack: &str, token: &str, from: usize) -> Option<usize> {
    let mut cursor = from;
    while let Some(rel) = haystack.get(cursor..)?.find(token) {
        let start = cursor + rel;
        let stop = start + token.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[stop..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(start);
        }
        cursor = stop;
    }
    None
}
