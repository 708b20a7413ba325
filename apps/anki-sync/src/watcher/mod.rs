//! File system watcher for markdown changes in the vault.

use notify::{
    event::{CreateKind, ModifyKind},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Quiet period that closes a batch of changes.
pub const DEBOUNCE: Duration = Duration::from_millis(750);

/// Watches a vault directory and hands out batches of changed documents.
pub struct VaultWatcher {
    _watcher: RecommendedWatcher,
    rx: UnboundedReceiver<PathBuf>,
}

impl VaultWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: &Path) -> Result<Self, notify::Error> {
        let (tx, rx) = unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                if !is_content_change(&event.kind) {
                    return;
                }
                for path in event.paths {
                    if is_markdown(&path) {
                        let _ = tx.send(path);
                    }
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next change, then collect further changes until
    /// `debounce` passes without one. `None` once the watcher is gone.
    pub async fn next_batch(&mut self, debounce: Duration) -> Option<BTreeSet<PathBuf>> {
        let first = self.rx.recv().await?;
        let mut batch = BTreeSet::from([first]);
        while let Ok(Some(path)) = tokio::time::timeout(debounce, self.rx.recv()).await {
            batch.insert(path);
        }
        Some(batch)
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}
