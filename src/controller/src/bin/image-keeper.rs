//! image-keeper: the registry proxy plus the CachedImage lifecycle and pod
//! reconcilers, sharing one cache directory.

use anyhow::Context;
use cachedimage::{CachedImage, ImageStore, KubeImageStore, UsageTracker};
use clap::Parser;
use controller::{Cli, Config, LifecycleReconciler, PodReconciler};
use kube::CustomResourceExt;
use proxy::{CacheStorage, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.print_crd {
        print!("{}", serde_yaml::to_string(&CachedImage::crd())?);
        return Ok(());
    }

    // Default to info level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(&cli)?;
    info!(
        cache_dir = %config.proxy.cache.directory,
        port = config.proxy.server.port,
        expiry_delay_days = config.lifecycle.expiry_delay_days,
        ignore_namespace = %config.pods.ignore_namespace,
        "image-keeper starting"
    );

    let client = kube::Client::try_default()
        .await
        .context("Cannot connect to the Kubernetes API")?;
    let store: Arc<dyn ImageStore> = Arc::new(KubeImageStore::new(client.clone()));
    let tracker = Arc::new(UsageTracker::new(store.clone(), config.lifecycle.error_threshold));
    let cache = Arc::new(
        CacheStorage::new(PathBuf::from(&config.proxy.cache.directory))
            .context("Cannot open the cache directory")?,
    );

    let proxy_hosts = config.proxy.server.proxy_hosts();
    let server = ProxyServer::bind_with_cache(config.proxy.clone(), cache.clone(), Some(tracker)).await?;
    info!(address = %server.local_addr()?, "Registry proxy ready");

    let lifecycle = Arc::new(LifecycleReconciler::new(
        store.clone(),
        Some(cache),
        config.lifecycle.clone(),
    ));
    let pods = Arc::new(PodReconciler::new(
        store,
        config.pods.clone(),
        config.lifecycle.expiry_delay(),
        proxy_hosts,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // Whichever part stops first takes the others down with it
    let (served, (), ()) = tokio::join!(
        async {
            let served = server.serve(shutdown.clone()).await;
            shutdown.cancel();
            served
        },
        async {
            lifecycle.run(client.clone(), shutdown.clone()).await;
            shutdown.cancel();
        },
        async {
            pods.run(client.clone(), shutdown.clone()).await;
            shutdown.cancel();
        },
    );
    served?;

    info!("image-keeper stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
