//! Headless lifecycle bridge for stdin/stdout JSON communication.
//!
//! Reads `BridgeCommand` lines from stdin, drives one conversation lifecycle
//! controller backed by the HTTP conversation store, and writes
//! `BridgeOutput` lines to stdout.
//!
//! All tracing output goes to stderr so that stdout remains a clean JSON
//! protocol channel.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::BufReader;
use voice_lifecycle::bridge::run_bridge;
use voice_lifecycle::config::LifecycleConfig;
use voice_lifecycle::persistence::HttpConversationStore;

fn load_config() -> anyhow::Result<LifecycleConfig> {
    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        tracing::info!(path = %path.display(), "loading config");
        return LifecycleConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()));
    }
    let path = LifecycleConfig::default_config_path();
    if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        return LifecycleConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()));
    }
    Ok(LifecycleConfig::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let store = HttpConversationStore::new(&config.persistence)
        .map_err(|e| anyhow::anyhow!("failed to create conversation store: {e}"))?;
    tracing::info!(url = %store.url(), "lifecycle-bridge starting");

    let input = BufReader::new(tokio::io::stdin());
    run_bridge(config, Arc::new(store), input, tokio::io::stdout())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "lifecycle-bridge exited with error");
            anyhow::anyhow!("lifecycle-bridge failed: {e}")
        })?;

    tracing::info!("lifecycle-bridge shut down cleanly");
    Ok(())
}
