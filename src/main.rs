use std::sync::Arc;

use anyhow::Context;
use deltasync::config::ServerConfig;
use deltasync::store::FjallStore;
use deltasync::SyncServer;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env()?;
    let store = match &config.data_dir {
        Some(dir) => FjallStore::open(dir)
            .with_context(|| format!("failed to open store at {}", dir.display()))?,
        None => FjallStore::temporary().context("failed to create temporary store")?,
    };
    let store = Arc::new(store);
    let app = SyncServer::new(store.clone(), store).router();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %listener.local_addr()?, data_dir = ?config.data_dir, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
