//! WebSocket RPC server for the authoritative update log.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── connection task ── dispatch ── UpdateLogRpc
//! Client B ──┘   (one request at a time)            │
//!                                                   ├── UpdateLogService
//!                                                   │       │
//!                                                   │       └── RocksStore
//!                                                   ▼
//!                                             RpcResponse (same request_id)
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 4

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{RpcCall, RpcReply, RpcRequest, RpcResponse};
use super::{RpcError, UpdateLogRpc};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory for the update log
    pub storage_path: PathBuf,
    /// Ids per delete statement during compaction
    pub delete_chunk: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: PathBuf::from("folio_data"),
            delete_chunk: 200,
        }
    }
}

/// Run one call against the service.
pub async fn dispatch(service: &dyn UpdateLogRpc, call: RpcCall) -> Result<RpcReply, RpcError> {
    match call {
        RpcCall::Create(row) => service.create(row).await.map(|()| RpcReply::Created),
        RpcCall::BatchCreate(rows) => service.batch_create(rows).await.map(RpcReply::BatchCreated),
        RpcCall::BatchDelete(ids) => service.batch_delete(ids).await.map(RpcReply::BatchDeleted),
        RpcCall::Gc(request) => service.gc(request).await.map(RpcReply::Gc),
    }
}

/// Serves an [`UpdateLogRpc`] implementation over WebSocket.
pub struct RpcServer {
    config: ServerConfig,
    service: Arc<dyn UpdateLogRpc>,
}

impl RpcServer {
    pub fn new(config: ServerConfig, service: Arc<dyn UpdateLogRpc>) -> Self {
        Self { config, service }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("RPC server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<dyn UpdateLogRpc>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        while let Some(msg) = ws_receiver.next().await {
            match msg? {
                Message::Binary(data) => {
                    let bytes: Vec<u8> = data.into();
                    let request = match RpcRequest::decode(&bytes) {
                        Ok(request) => request,
                        Err(e) => {
                            log::warn!("Dropping undecodable request from {addr}: {e}");
                            continue;
                        }
                    };

                    let method = request.call.method();
                    let result = dispatch(service.as_ref(), request.call).await;
                    if let Err(e) = &result {
                        log::warn!("{method} from {addr} failed: {e}");
                    } else {
                        log::debug!("{method} from {addr} ok");
                    }

                    let response = RpcResponse {
                        request_id: request.request_id,
                        result,
                    };
                    ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        log::info!("WebSocket connection from {addr} closed");
        Ok(())
    }
}
