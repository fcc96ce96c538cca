//! Binary RPC protocol.
//!
//! Wire format (bincode-encoded, one WebSocket binary frame per message):
//! ```text
//! request:  ┌────────────┬──────────────────────────────────────┐
//!           │ request_id │ call (create | batch_create | ...)   │
//!           │ varint     │ variable                             │
//!           └────────────┴──────────────────────────────────────┘
//! response: ┌────────────┬──────────────────────────────────────┐
//!           │ request_id │ Ok(reply) | Err(RpcError)            │
//!           └────────────┴──────────────────────────────────────┘
//! ```
//!
//! Row payloads travel as [`UpdateRowInput`], i.e. base64 text, so the
//! server accepts exactly what a text-based transport would carry.

use serde::{Deserialize, Serialize};

use super::{BatchCreateResponse, BatchDeleteResponse, GcRequest, GcResponse, RpcError};
use crate::row::UpdateRowInput;

/// A remote call and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcCall {
    Create(UpdateRowInput),
    BatchCreate(Vec<UpdateRowInput>),
    BatchDelete(Vec<String>),
    Gc(GcRequest),
}

impl RpcCall {
    /// Method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::Create(_) => "create",
            RpcCall::BatchCreate(_) => "batch_create",
            RpcCall::BatchDelete(_) => "batch_delete",
            RpcCall::Gc(_) => "gc",
        }
    }
}

/// Successful result of an [`RpcCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcReply {
    Created,
    BatchCreated(BatchCreateResponse),
    BatchDeleted(BatchDeleteResponse),
    Gc(GcResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Echoed in the matching response.
    pub request_id: u64,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: u64,
    pub result: Result<RpcReply, RpcError>,
}

impl RpcRequest {
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        decode(bytes)
    }
}

impl RpcResponse {
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RpcError::transport(format!("serialization failed: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RpcError::transport(format!("deserialization failed: {e}")))?;
    Ok(value)
}
