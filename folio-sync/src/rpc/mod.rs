//! Remote update-log surface.
//!
//! ```text
//! ┌───────────────┐  RpcRequest (bincode)  ┌───────────────┐
//! │ RpcClient     │ ─────────────────────► │ RpcServer     │
//! │ (UpdateLogRpc)│ ◄───────────────────── │               │
//! └───────────────┘  RpcResponse           └───────┬───────┘
//!                      WebSocket                   │
//!                                                  ▼
//!                                         ┌─────────────────┐
//!                                         │UpdateLogService │
//!                                         │ (UpdateLogRpc)  │
//!                                         └─────────────────┘
//! ```
//!
//! Both ends implement [`UpdateLogRpc`], so the upload connector can talk to
//! the service in-process or across the wire.

pub mod client;
pub mod protocol;
pub mod server;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::row::UpdateRowInput;
use crate::target::TargetKey;

pub use client::RpcClient;
pub use protocol::{RpcCall, RpcReply, RpcRequest, RpcResponse};
pub use server::{RpcServer, ServerConfig};

/// How a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// Connection, timeout or framing failure; the call may not have run.
    Transport,
    /// The server failed while handling the call.
    Server,
    /// The server refused the call; `code` says why.
    Rejected,
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcErrorKind::Transport => "transport",
            RpcErrorKind::Server => "server",
            RpcErrorKind::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Remote call error.
///
/// `code` carries a SQLSTATE-style response code when the server supplied
/// one (e.g. `23505` for a unique violation).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error{}: {message}", .code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl RpcError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: RpcErrorKind::Transport,
            code: None,
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            kind: RpcErrorKind::Server,
            code: None,
            message: message.into(),
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: RpcErrorKind::Rejected,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Transport and server failures are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, RpcErrorKind::Transport | RpcErrorKind::Server)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreateResponse {
    pub created: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleteResponse {
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRequest {
    pub target: TargetKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResponse {
    /// Human-readable summary, e.g. "4 update rows compacted for note:1".
    pub success: String,
}

/// Remote operations on the authoritative update log.
#[async_trait]
pub trait UpdateLogRpc: Send + Sync {
    async fn create(&self, row: UpdateRowInput) -> Result<(), RpcError>;

    async fn batch_create(&self, rows: Vec<UpdateRowInput>) -> Result<BatchCreateResponse, RpcError>;

    async fn batch_delete(&self, ids: Vec<String>) -> Result<BatchDeleteResponse, RpcError>;

    /// Compact the authoritative log of one target.
    async fn gc(&self, request: GcRequest) -> Result<GcResponse, RpcError>;
}
