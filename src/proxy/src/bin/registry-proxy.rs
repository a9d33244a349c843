//! Standalone registry proxy, without CachedImage tracking.

use proxy::{ProxyConfig, ProxyServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Optional YAML config path as the only argument
    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::from_file(&PathBuf::from(path))?,
        None => ProxyConfig::default(),
    };

    let server = ProxyServer::bind(config, None).await?;
    tracing::info!(address = %server.local_addr()?, "Registry proxy ready");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl+C"),
        }
    });

    server.serve(shutdown).await?;
    Ok(())
}
