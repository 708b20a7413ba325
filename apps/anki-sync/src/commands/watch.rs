//! `watch` command: resync saved documents and run on a schedule.

use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};

use super::sync::run_sync;
use super::App;
use crate::sync::SyncRequest;
use crate::vault::Scope;
use crate::watcher::{VaultWatcher, DEBOUNCE};

pub async fn watch(app: &App) -> anyhow::Result<()> {
    let mut watcher = VaultWatcher::start(app.vault.root())?;

    let minutes = app.engine.settings().await.defaults.scheduling_interval;
    let mut schedule = (minutes > 0).then(|| {
        let mut ticker = interval(Duration::from_secs(minutes * 60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    info!(
        "Watching {} (scheduled sync: {})",
        app.vault.root().display(),
        if minutes > 0 {
            format!("every {} min", minutes)
        } else {
            "off".to_string()
        }
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watcher");
                break;
            }
            batch = watcher.next_batch(DEBOUNCE) => {
                let Some(batch) = batch else { break };
                for path in batch {
                    let Some(handle) = app.vault.handle_for(&path) else { continue };
                    if !path.is_file() {
                        continue;
                    }
                    let request = SyncRequest {
                        scope: Scope::File(handle.path),
                        force: false,
                    };
                    if let Err(e) = run_sync(&app.engine, request).await {
                        warn!("Sync of changed document failed: {}", e);
                    }
                }
            }
            _ = tick(&mut schedule) => {
                if let Err(e) = run_sync(&app.engine, SyncRequest::default()).await {
                    warn!("Scheduled sync failed: {}", e);
                }
            }
        }
    }
    Ok(())
}

async fn tick(schedule: &mut Option<Interval>) {
    match schedule {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
