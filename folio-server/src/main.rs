//! Authoritative update-log server.
//!
//! Environment:
//! - `FOLIO_BIND_ADDR` — listen address (default `127.0.0.1:9090`)
//! - `FOLIO_DATA_DIR` — RocksDB directory (default `folio_data`)
//! - `FOLIO_GC_DELETE_CHUNK` — ids per delete during compaction (default 200)
//! - `RUST_LOG` — log filter, e.g. `info` or `folio_sync=debug`

use std::path::PathBuf;
use std::sync::Arc;

use folio_sync::{RocksStore, RpcServer, ServerConfig, StoreConfig, UpdateLogService};
use log::info;

fn server_config() -> Result<ServerConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("FOLIO_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(dir) = std::env::var("FOLIO_DATA_DIR") {
        config.storage_path = PathBuf::from(dir);
    }
    if let Ok(chunk) = std::env::var("FOLIO_GC_DELETE_CHUNK") {
        config.delete_chunk = chunk.parse()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = server_config()?;
    info!("Starting Folio update-log server...");

    let store = RocksStore::open(StoreConfig {
        path: config.storage_path.clone(),
        sync_writes: true,
        ..StoreConfig::default()
    })?;
    info!("Update log opened at {}", store.path().display());

    let service = Arc::new(UpdateLogService::new(Arc::new(store), config.delete_chunk));
    RpcServer::new(config, service).run().await
}
