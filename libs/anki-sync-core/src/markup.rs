//! Document-level markup helpers: frontmatter, heading outline, inline tags,
//! media embeds and file links.

use regex::Regex;
use serde_yaml::Value;

use crate::config::split_tags;
use crate::types::{Frontmatter, MediaReference};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "tiff"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac", "opus"];

/// Parse the YAML frontmatter block at the top of a document.
///
/// Returns `None` when the document has no frontmatter or it is not valid YAML.
pub fn parse_frontmatter(content: &str) -> Option<Frontmatter> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let end = rest
        .match_indices("\n---")
        .map(|(i, _)| i)
        .find(|&i| {
            let after = &rest[i + 4..];
            after.is_empty() || after.starts_with('\n') || after.starts_with("\r\n")
        })?;
    let yaml = &rest[..end];
    let value: Value = serde_yaml::from_str(yaml).ok()?;

    let list = |keys: &[&str]| -> Vec<String> {
        keys.iter()
            .filter_map(|k| value.get(*k))
            .flat_map(yaml_strings)
            .collect()
    };

    Some(Frontmatter {
        tags: list(&["tags", "tag"])
            .iter()
            .flat_map(|t| split_tags(t))
            .collect(),
        aliases: list(&["aliases", "alias"]),
    })
}

fn yaml_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Sequence(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Heading {
    offset: usize,
    level: usize,
    title: String,
}

/// ATX heading outline of a document, for context breadcrumbs.
#[derive(Debug, Clone, Default)]
pub struct Outline {
    headings: Vec<Heading>,
}

impl Outline {
    pub fn parse(content: &str) -> Self {
        let mut headings = Vec::new();
        let mut offset = 0;
        let mut in_fence = false;

        for raw in content.split_inclusive('\n') {
            let line = raw.trim_end_matches(['\n', '\r']);
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
            } else if !in_fence && line.starts_with('#') {
                let level = line.chars().take_while(|&c| c == '#').count();
                let title = &line[level..];
                if level <= 6 && title.starts_with(' ') && !title.trim().is_empty() {
                    headings.push(Heading {
                        offset,
                        level,
                        title: title.trim().trim_end_matches('#').trim_end().to_string(),
                    });
                }
            }
            offset += raw.len();
        }

        Self { headings }
    }

    /// Titles of the headings enclosing `offset`, outermost first.
    pub fn path_at(&self, offset: usize) -> Vec<String> {
        let mut stack: Vec<&Heading> = Vec::new();
        for heading in self.headings.iter().take_while(|h| h.offset < offset) {
            while stack.last().is_some_and(|top| top.level >= heading.level) {
                stack.pop();
            }
            stack.push(heading);
        }
        stack.into_iter().map(|h| h.title.clone()).collect()
    }
}

/// Breadcrumb like `folder/doc > Heading 1 > Heading 2`.
pub fn breadcrumb(path: &str, headings: &[String]) -> String {
    let doc = path.strip_suffix(".md").unwrap_or(path);
    std::iter::once(doc)
        .chain(headings.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Removes `#tag` tokens from text and reports them.
pub struct TagExtractor {
    re: Regex,
}

impl TagExtractor {
    pub fn new() -> Self {
        Self {
            re: Regex::new(r"(^|\s)#([\p{L}\p{N}_\-/]*[\p{L}_\-/][\p{L}\p{N}_\-/]*)")
                .expect("valid tag regex"),
        }
    }

    /// Strip inline tags from `text`, returning the cleaned text and the tags
    /// found. Nested tags `a/b` become `a::b`.
    pub fn extract(&self, text: &str) -> (String, Vec<String>) {
        let mut tags = Vec::new();
        let mut cleaned = String::with_capacity(text.len());
        let mut last = 0;

        for caps in self.re.captures_iter(text) {
            let Some(name) = caps.get(2) else { continue };
            let hash = name.start() - 1;
            cleaned.push_str(&text[last..hash]);
            let mut end = name.end();
            // Swallow one following space so "a #tag b" becomes "a b".
            if text[end..].starts_with(' ')
                && (cleaned.is_empty() || cleaned.ends_with(char::is_whitespace))
            {
                end += 1;
            }
            last = end;
            tags.push(name.as_str().trim_end_matches('/').replace('/', "::"));
        }
        cleaned.push_str(&text[last..]);

        let cleaned = cleaned
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
        (cleaned, tags)
    }
}

impl Default for TagExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrites media embeds into their remote form and reports the references.
pub struct MediaScanner {
    wiki: Regex,
    markdown: Regex,
}

impl MediaScanner {
    pub fn new() -> Self {
        Self {
            wiki: Regex::new(r"!\[\[([^\]|#]+)(?:[|#][^\]]*)?\]\]").expect("valid embed regex"),
            markdown: Regex::new(r"!\[[^\]]*\]\(([^)\s]+)\)").expect("valid image regex"),
        }
    }

    /// Replace image embeds with `<img>` tags and audio embeds with
    /// `[sound:]` tags. Other embeds are left untouched.
    pub fn rewrite(&self, text: &str) -> (String, Vec<MediaReference>) {
        let mut refs = Vec::new();
        let mut render = |caps: &regex::Captures<'_>| -> String {
            let link = caps[1].trim();
            match media_reference(link) {
                Some((reference, MediaKind::Image)) => {
                    let tag = format!("<img src=\"{}\">", reference.filename);
                    refs.push(reference);
                    tag
                }
                Some((reference, MediaKind::Audio)) => {
                    let tag = format!("[sound:{}]", reference.filename);
                    refs.push(reference);
                    tag
                }
                None => caps[0].to_string(),
            }
        };
        let text = self.wiki.replace_all(text, &mut render).into_owned();
        let text = self.markdown.replace_all(&text, &mut render).into_owned();
        (text, refs)
    }
}

impl Default for MediaScanner {
    fn default() -> Self {
        Self::new()
    }
}

enum MediaKind {
    Image,
    Audio,
}

fn media_reference(link: &str) -> Option<(MediaReference, MediaKind)> {
    if link.contains("://") {
        return None;
    }
    let decoded = urlencoding::decode(link)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| link.to_string());
    let filename = decoded.rsplit('/').next()?.to_string();
    let ext = filename.rsplit_once('.')?.1.to_lowercase();
    let kind = if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Image
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Audio
    } else {
        return None;
    };
    Some((
        MediaReference {
            filename,
            link: decoded,
        },
        kind,
    ))
}

/// HTML link that opens `path` in the named vault.
pub fn file_link(vault: &str, path: &str) -> String {
    let name = path.strip_suffix(".md").unwrap_or(path);
    format!(
        "<a href=\"obsidian://open?vault={}&file={}\">{}</a>",
        urlencoding::encode(vault),
        urlencoding::encode(path),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frontmatter_tags_and_aliases() {
        let doc = "---\ntags: [rust, lang]\naliases:\n  - Borrowing\n---\n# Body\n";
        let fm = parse_frontmatter(doc).unwrap();
        assert_eq!(fm.tags, vec!["rust".to_string(), "lang".to_string()]);
        assert_eq!(fm.aliases, vec!["Borrowing".to_string()]);
    }

    #[test]
    fn frontmatter_comma_string_tags() {
        let fm = parse_frontmatter("---\ntags: a, b\n---\n").unwrap();
        assert_eq!(fm.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn no_frontmatter() {
        assert!(parse_frontmatter("# Title\n---\n").is_none());
    }

    #[test]
    fn heading_path_tracks_nesting() {
        let doc = "# A\ntext\n## B\n### C\n## D\nhere\n";
        let outline = Outline::parse(doc);
        let here = doc.find("here").unwrap();
        assert_eq!(outline.path_at(here), vec!["A".to_string(), "D".to_string()]);
        assert!(outline.path_at(0).is_empty());
    }

    #[test]
    fn headings_in_code_fences_are_ignored() {
        let doc = "# Real\n```\n# not a heading\n```\nx";
        let outline = Outline::parse(doc);
        assert_eq!(outline.path_at(doc.len()), vec!["Real".to_string()]);
    }

    #[test]
    fn breadcrumb_format() {
        let crumb = breadcrumb("notes/rust.md", &["Ownership".to_string()]);
        assert_eq!(crumb, "notes/rust > Ownership");
    }

    #[test]
    fn extract_inline_tags() {
        let (text, tags) = TagExtractor::new().extract("What is #rust ownership? #lang/systems\n# Heading #2");
        assert_eq!(text, "What is ownership?\n# Heading #2");
        assert_eq!(tags, vec!["rust".to_string(), "lang::systems".to_string()]);
    }

    #[test]
    fn rewrite_media_embeds() {
        let (text, refs) = MediaScanner::new()
            .rewrite("See ![[diagrams/ownership.png|200]] and ![clip](audio/say%20hi.mp3) ![[other.md]]");
        assert_eq!(
            text,
            "See <img src=\"ownership.png\"> and [sound:say hi.mp3] ![[other.md]]"
        );
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].filename, "ownership.png");
        assert_eq!(refs[0].link, "diagrams/ownership.png");
        assert_eq!(refs[1].filename, "say hi.mp3");
    }

    #[test]
    fn remote_images_are_not_media() {
        let (text, refs) = MediaScanner::new().rewrite("![x](https://example.com/a.png)");
        assert!(refs.is_empty());
        assert_eq!(text, "![x](https://example.com/a.png)");
    }

    #[test]
    fn file_link_is_encoded() {
        assert_eq!(
            file_link("My Vault", "dir/a b.md"),
            "<a href=\"obsidian://open?vault=My%20Vault&file=dir%2Fa%20b.md\">dir/a b</a>"
        );
    }
}
