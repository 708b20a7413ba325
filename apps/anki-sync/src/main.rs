#[tokio::main]
async fn main() -> anyhow::Result<()> {
    anki_sync_lib::run().await
}
