//! anki-sync: keeps Anki notes in step with flashcards written in a
//! markdown vault.

pub mod anki;
pub mod commands;
pub mod db;
pub mod settings;
pub mod sync;
pub mod vault;
pub mod watcher;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = commands::Cli::parse();
    commands::dispatch(cli).await
}
