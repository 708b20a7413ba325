//! Command-line interface of the `anki-sync` binary.

pub mod sync;
pub mod watch;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::anki::AnkiConnect;
use crate::db::SqliteStateStore;
use crate::settings;
use crate::sync::SyncEngine;
use crate::vault::FsVault;

#[derive(Debug, Parser)]
#[command(
    name = "anki-sync",
    version,
    about = "Sync flashcards written in markdown notes to Anki through AnkiConnect"
)]
pub struct Cli {
    /// Vault root directory.
    #[arg(long, global = true, default_value = ".")]
    pub vault: PathBuf,

    /// Settings file (JSON). Defaults to the data directory.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// State database. Defaults to the data directory.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// AnkiConnect URL, overriding the settings file.
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sync the vault, one folder or one file.
    Sync {
        /// Only this document (vault-relative or absolute path).
        #[arg(long, conflicts_with = "folder")]
        file: Option<String>,

        /// Only documents under this folder.
        #[arg(long)]
        folder: Option<String>,

        /// Rescan documents whose content did not change.
        #[arg(long)]
        force: bool,
    },

    /// Delete every note whose id appears in FILE and remove the ids from it.
    DeleteIds { file: String },

    /// Sync changed documents as they are saved, and on the configured schedule.
    Watch,
}

/// Everything a command needs.
pub struct App {
    pub engine: SyncEngine<AnkiConnect>,
    pub vault: Arc<FsVault>,
    pub settings_path: PathBuf,
}

impl App {
    pub fn open(cli: &Cli) -> anyhow::Result<Self> {
        let settings_path = cli
            .settings
            .clone()
            .unwrap_or_else(settings::default_settings_path);
        let mut loaded = settings::load(&settings_path)
            .with_context(|| format!("Failed to load {}", settings_path.display()))?;
        if let Some(url) = &cli.url {
            loaded.anki_connect_url = url.clone();
        }
        if loaded.vault_name.is_empty() {
            loaded.vault_name = vault_name(&cli.vault);
        }

        let vault = Arc::new(FsVault::from_settings(&cli.vault, &loaded)?);

        let db_path = cli.db.clone().unwrap_or_else(settings::default_db_path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = SqliteStateStore::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;

        let api = AnkiConnect::new(loaded.anki_connect_url.clone());
        let engine = SyncEngine::new(api, vault.clone(), state, loaded);

        Ok(Self {
            engine,
            vault,
            settings_path,
        })
    }

    /// Vault-relative form of a path given on the command line.
    pub fn relative_path(&self, input: &str) -> String {
        let path = Path::new(input);
        if path.is_absolute() {
            if let Ok(rel) = path.strip_prefix(self.vault.root()) {
                return rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
            }
        }
        input.trim_start_matches("./").replace('\\', "/")
    }
}

fn vault_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// Run the parsed command.
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let app = App::open(&cli)?;
    match cli.command {
        Command::Sync {
            file,
            folder,
            force,
        } => sync::sync(&app, file, folder, force).await,
        Command::DeleteIds { file } => sync::delete_ids(&app, &file).await,
        Command::Watch => watch::watch(&app).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_flags() {
        let cli = Cli::parse_from(["anki-sync", "--vault", "/v", "sync", "--folder", "bio", "--force"]);
        assert_eq!(cli.vault, PathBuf::from("/v"));
        match cli.command {
            Command::Sync {
                file,
                folder,
                force,
            } => {
                assert_eq!(file, None);
                assert_eq!(folder.as_deref(), Some("bio"));
                assert!(force);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_file_and_folder_conflict() {
        let parsed = Cli::try_parse_from(["anki-sync", "sync", "--file", "a.md", "--folder", "b"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_delete_ids() {
        let cli = Cli::parse_from(["anki-sync", "delete-ids", "notes/a.md", "--url", "http://x"]);
        assert_eq!(cli.url.as_deref(), Some("http://x"));
        assert!(matches!(cli.command, Command::DeleteIds { file } if file == "notes/a.md"));
    }
}
