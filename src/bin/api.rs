use fund_assistant::{api::start_server, config::AssistantConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables before the filter reads RUST_LOG
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AssistantConfig::from_env()?;

    info!("Fund Assistant - Webhook Server");
    info!(port = config.port, backend = ?config.ledger_backend, "Configuration loaded");

    let assistant = Arc::new(config.build_assistant()?);
    start_server(assistant, config.port).await?;

    Ok(())
}
