//! Indexer server binary

use anyhow::Context;
use indexer::{
    BlobStore, Config, EventIndexer, FileAgentDirectory, FileBlobStore, RocksDbBlobStore,
    SnapshotBackend,
};
use ledger_rpc::RpcLedgerClient;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config file from the first argument, environment otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::from_env().context("reading INDEXER_* environment")?,
    };

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(rpc = %config.rpc.url, "Starting vault indexer");

    let client = Arc::new(RpcLedgerClient::new(config.rpc.clone())?);
    let directory = Arc::new(FileAgentDirectory::new(config.directory_path.clone()));
    let blobs: Arc<dyn BlobStore> = match &config.snapshot.backend {
        SnapshotBackend::File { path } => Arc::new(FileBlobStore::new(path.clone())),
        SnapshotBackend::RocksDb { path } => Arc::new(RocksDbBlobStore::open(path)?),
    };

    let indexer = EventIndexer::new(config, client, directory, blobs)?;
    indexer.start().await?;
    let status = indexer.status().await?;
    tracing::info!(
        vaults = status.vaults_tracked,
        events = status.events_indexed,
        "Indexer serving restored stats, backfill continues in background"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down indexer");
    indexer.shutdown().await?;
    Ok(())
}
