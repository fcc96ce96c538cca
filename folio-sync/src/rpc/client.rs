//! WebSocket RPC client.
//!
//! Provides:
//! - Lazy connection on first call, re-established after a disconnect
//! - Request/response correlation by request id
//! - Per-call timeout, surfaced as a retryable transport error
//!
//! Reference: Kleppmann, Chapter 4 — Dataflow Through Services

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{RpcCall, RpcReply, RpcRequest, RpcResponse};
use super::{BatchCreateResponse, BatchDeleteResponse, GcRequest, GcResponse, RpcError, UpdateLogRpc};
use crate::row::UpdateRowInput;

type PendingCalls = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<RpcReply, RpcError>>>>>;

/// Live WebSocket connection and its in-flight calls.
struct Connection {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: PendingCalls,
    alive: Arc<AtomicBool>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }
}

fn lock_pending(
    pending: &PendingCalls,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<RpcReply, RpcError>>>> {
    pending.lock().unwrap_or_else(|p| p.into_inner())
}

/// Client side of the update-log RPC.
pub struct RpcClient {
    url: String,
    timeout: Duration,
    next_request: AtomicU64,
    connection: Mutex<Option<Connection>>,
}

impl RpcClient {
    /// `url` is a `ws://` address. Nothing connects until the first call.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            next_request: AtomicU64::new(1),
            connection: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(Connection::is_alive)
    }

    /// Issue one call and wait for its response.
    pub async fn call(&self, call: RpcCall) -> Result<RpcReply, RpcError> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let method = call.method();
        let encoded = RpcRequest { request_id, call }.encode()?;

        let (tx, rx) = oneshot::channel();
        let pending = {
            let mut connection = self.connection.lock().await;
            if !connection.as_ref().is_some_and(Connection::is_alive) {
                *connection = Some(self.connect().await?);
            }
            let Some(conn) = connection.as_ref() else {
                return Err(RpcError::transport("not connected"));
            };
            lock_pending(&conn.pending).insert(request_id, tx);
            if conn.outgoing.send(encoded).await.is_err() {
                lock_pending(&conn.pending).remove(&request_id);
                return Err(RpcError::transport("connection closed"));
            }
            conn.pending.clone()
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::transport(format!("{method}: connection lost"))),
            Err(_) => {
                lock_pending(&pending).remove(&request_id);
                log::warn!("{method} timed out after {:?}", self.timeout);
                Err(RpcError::transport(format!("{method}: timed out")))
            }
        }
    }

    /// Open the WebSocket and spawn its writer and reader tasks.
    async fn connect(&self) -> Result<Connection, RpcError> {
        let (ws_stream, _) = tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(&self.url))
            .await
            .map_err(|_| RpcError::transport(format!("connect to {} timed out", self.url)))?
            .map_err(|e| RpcError::transport(format!("connect to {} failed: {e}", self.url)))?;
        log::debug!("connected to {}", self.url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let pending: PendingCalls = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        let writer_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::SeqCst);
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses to their callers
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RpcResponse::decode(&bytes) {
                            Ok(response) => {
                                let waiter = lock_pending(&reader_pending).remove(&response.request_id);
                                if let Some(waiter) = waiter {
                                    let _ = waiter.send(response.result);
                                }
                            }
                            Err(e) => log::warn!("undecodable response from {url}: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail everything still in flight.
            reader_alive.store(false, Ordering::SeqCst);
            lock_pending(&reader_pending).clear();
            log::debug!("connection to {url} closed");
        });

        Ok(Connection {
            outgoing: out_tx,
            pending,
            alive,
        })
    }
}

fn unexpected(reply: RpcReply) -> RpcError {
    RpcError::transport(format!("unexpected reply {reply:?}"))
}

#[async_trait]
impl UpdateLogRpc for RpcClient {
    async fn create(&self, row: UpdateRowInput) -> Result<(), RpcError> {
        match self.call(RpcCall::Create(row)).await? {
            RpcReply::Created => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn batch_create(&self, rows: Vec<UpdateRowInput>) -> Result<BatchCreateResponse, RpcError> {
        match self.call(RpcCall::BatchCreate(rows)).await? {
            RpcReply::BatchCreated(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn batch_delete(&self, ids: Vec<String>) -> Result<BatchDeleteResponse, RpcError> {
        match self.call(RpcCall::BatchDelete(ids)).await? {
            RpcReply::BatchDeleted(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn gc(&self, request: GcRequest) -> Result<GcResponse, RpcError> {
        match self.call(RpcCall::Gc(request)).await? {
            RpcReply::Gc(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}
