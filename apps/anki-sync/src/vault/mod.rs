//! Host storage collaborator: a vault of markdown documents on disk.
//!
//! Documents are addressed by vault-relative paths with `/` separators. Ignore
//! globs and hidden directories are filtered here, before anything reaches
//! the sync engine.

pub mod error;

pub use error::HostError;

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use anki_sync_core::Settings;

type Result<T> = std::result::Result<T, HostError>;

/// A document inside the vault.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentHandle {
    /// Vault-relative path with `/` separators.
    pub path: String,
}

impl DocumentHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Containing folder, empty at the vault root.
    pub fn folder(&self) -> &str {
        self.path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }
}

/// Which documents a run looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every document under the configured scan directory.
    Vault,
    Folder(String),
    File(String),
}

/// Document storage used by the sync engine.
pub trait DocumentStore: Send + Sync {
    /// Documents in `scope`, ordered by path.
    fn list_documents(&self, scope: &Scope) -> Result<Vec<DocumentHandle>>;
    fn read_text(&self, doc: &DocumentHandle) -> Result<String>;
    fn write_text(&self, doc: &DocumentHandle, text: &str) -> Result<()>;
    /// Local file for a media reference made from `doc`, if it can be found.
    fn media_path(&self, doc: &DocumentHandle, filename: &str) -> Option<PathBuf>;
}

/// Vault rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
    scan_directory: String,
    ignored: Vec<Pattern>,
}

impl FsVault {
    pub fn new(
        root: impl Into<PathBuf>,
        scan_directory: &str,
        ignored_globs: &[String],
    ) -> Result<Self> {
        let ignored = ignored_globs
            .iter()
            .filter(|g| !g.trim().is_empty())
            .map(|g| {
                Pattern::new(g.trim()).map_err(|e| HostError::Pattern {
                    pattern: g.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: root.into(),
            scan_directory: scan_directory.trim().trim_matches('/').to_string(),
            ignored,
        })
    }

    pub fn from_settings(root: impl Into<PathBuf>, settings: &Settings) -> Result<Self> {
        Self::new(
            root,
            &settings.defaults.scan_directory,
            &settings.ignored_file_globs,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handle for an absolute path, if it is a markdown document this vault
    /// would list.
    pub fn handle_for(&self, path: &Path) -> Option<DocumentHandle> {
        if !is_markdown(path) {
            return None;
        }
        let rel = self.relative(path)?;
        if self.is_ignored(&rel) || rel.split('/').any(|part| part.starts_with('.')) {
            return None;
        }
        Some(DocumentHandle::new(rel))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        rel.split('/')
            .filter(|p| !p.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    fn is_ignored(&self, rel: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.ignored.iter().any(|p| p.matches_with(rel, options))
    }

    fn walk(&self, dir: &Path) -> Vec<DocumentHandle> {
        let mut docs: Vec<_> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_markdown(e.path()))
            .filter_map(|e| self.relative(e.path()))
            .filter(|rel| !self.is_ignored(rel))
            .map(DocumentHandle::new)
            .collect();
        docs.sort();
        docs
    }
}

impl DocumentStore for FsVault {
    fn list_documents(&self, scope: &Scope) -> Result<Vec<DocumentHandle>> {
        match scope {
            Scope::Vault => Ok(self.walk(&self.absolute(&self.scan_directory))),
            Scope::Folder(folder) => {
                let dir = self.absolute(folder.trim_matches('/'));
                if !dir.is_dir() {
                    return Err(HostError::NotFound(folder.clone()));
                }
                Ok(self.walk(&dir))
            }
            Scope::File(file) => {
                let path = self.absolute(file.trim_matches('/'));
                if !path.is_file() {
                    return Err(HostError::NotFound(file.clone()));
                }
                Ok(self.handle_for(&path).into_iter().collect())
            }
        }
    }

    fn read_text(&self, doc: &DocumentHandle) -> Result<String> {
        std::fs::read_to_string(self.absolute(&doc.path)).map_err(|e| HostError::io(&doc.path, e))
    }

    fn write_text(&self, doc: &DocumentHandle, text: &str) -> Result<()> {
        std::fs::write(self.absolute(&doc.path), text).map_err(|e| HostError::io(&doc.path, e))
    }

    fn media_path(&self, doc: &DocumentHandle, filename: &str) -> Option<PathBuf> {
        // 1. Next to the document, 2. relative to the vault root
        let candidates = [
            self.absolute(doc.folder()).join(filename),
            self.absolute(filename),
        ];
        if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
            return Some(found);
        }

        // 3. Anywhere in the vault, by basename
        let basename = Path::new(filename).file_name()?;
        WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == basename)
            .map(|e| e.into_path())
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn vault_with(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "text").unwrap();
        }
        dir
    }

    fn paths(docs: Vec<DocumentHandle>) -> Vec<String> {
        docs.into_iter().map(|d| d.path).collect()
    }

    #[test]
    fn test_lists_markdown_sorted_and_skips_hidden() {
        let dir = vault_with(&["b.md", "a/c.md", ".obsidian/x.md", "img.png", "a/z.txt"]);
        let vault = FsVault::new(dir.path(), "", &[]).unwrap();
        let docs = vault.list_documents(&Scope::Vault).unwrap();
        assert_eq!(paths(docs), vec!["a/c.md", "b.md"]);
    }

    #[test]
    fn test_ignore_globs_filter_documents() {
        let dir = vault_with(&["draw.excalidraw.md", "sub/d.excalidraw.md", "keep.md"]);
        let vault = FsVault::new(
            dir.path(),
            "",
            &["**/*.excalidraw.md".to_string(), "*.excalidraw.md".to_string()],
        )
        .unwrap();
        assert_eq!(paths(vault.list_documents(&Scope::Vault).unwrap()), vec!["keep.md"]);
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let dir = vault_with(&[]);
        let err = FsVault::new(dir.path(), "", &["[".to_string()]).unwrap_err();
        assert!(matches!(err, HostError::Pattern { .. }));
    }

    #[test]
    fn test_scan_directory_and_folder_scope() {
        let dir = vault_with(&["top.md", "cards/one.md", "cards/deep/two.md", "other/x.md"]);
        let vault = FsVault::new(dir.path(), "cards", &[]).unwrap();
        assert_eq!(
            paths(vault.list_documents(&Scope::Vault).unwrap()),
            vec!["cards/deep/two.md", "cards/one.md"]
        );
        assert_eq!(
            paths(vault.list_documents(&Scope::Folder("other".to_string())).unwrap()),
            vec!["other/x.md"]
        );
    }

    #[test]
    fn test_file_scope() {
        let dir = vault_with(&["a/b.md"]);
        let vault = FsVault::new(dir.path(), "", &[]).unwrap();
        assert_eq!(
            paths(vault.list_documents(&Scope::File("a/b.md".to_string())).unwrap()),
            vec!["a/b.md"]
        );
        assert!(matches!(
            vault.list_documents(&Scope::File("missing.md".to_string())),
            Err(HostError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_write_round_trip() {
        let dir = vault_with(&["n.md"]);
        let vault = FsVault::new(dir.path(), "", &[]).unwrap();
        let doc = DocumentHandle::new("n.md");
        vault.write_text(&doc, "new text").unwrap();
        assert_eq!(vault.read_text(&doc).unwrap(), "new text");
    }

    #[test]
    fn test_media_lookup_order() {
        let dir = vault_with(&["notes/a.md", "notes/pic.png", "assets/deep/clip.mp3"]);
        let vault = FsVault::new(dir.path(), "", &[]).unwrap();
        let doc = DocumentHandle::new("notes/a.md");
        assert_eq!(
            vault.media_path(&doc, "pic.png"),
            Some(dir.path().join("notes").join("pic.png"))
        );
        assert_eq!(
            vault.media_path(&doc, "clip.mp3"),
            Some(dir.path().join("assets").join("deep").join("clip.mp3"))
        );
        assert_eq!(vault.media_path(&doc, "nope.png"), None);
    }

    #[test]
    fn test_handle_for_filters_like_listing() {
        let dir = vault_with(&[]);
        let vault = FsVault::new(dir.path(), "", &["*.excalidraw.md".to_string()]).unwrap();
        assert_eq!(
            vault.handle_for(&dir.path().join("x").join("y.md")),
            Some(DocumentHandle::new("x/y.md"))
        );
        assert_eq!(vault.handle_for(&dir.path().join("y.txt")), None);
        assert_eq!(vault.handle_for(&dir.path().join(".trash").join("y.md")), None);
        assert_eq!(vault.handle_for(&dir.path().join("d.excalidraw.md")), None);
    }
}
