use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    broker_cli::main_entry().await
}
