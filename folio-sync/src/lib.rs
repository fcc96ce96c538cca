//! # folio-sync — Offline-first CRDT persistence for Folio documents
//!
//! Every collaborative document is a Yrs doc whose history lives as an
//! append-only log of binary update rows in a local store. Rows flow to the
//! authoritative server through an upload queue, and the log is periodically
//! compacted into a single snapshot row per target.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  acquire/release  ┌────────────────┐
//! │ SessionCache │ ────────────────► │ UpdateProvider │ ◄── Yrs Doc edits
//! │ (refcounted) │                   │ (throttled)    │
//! └──────────────┘                   └───────┬────────┘
//!                                  write ▲   │ watch
//!                                        │   ▼
//!                                ┌─────────────────┐
//!                                │   UpdateStore   │  RocksStore / MemoryStore
//!                                │ + UploadQueue   │
//!                                └────────┬────────┘
//!                                         │ crud transactions
//!                                         ▼
//!                                ┌─────────────────┐   WebSocket   ┌──────────────────┐
//!                                │ UploadConnector │ ────────────► │ RpcServer        │
//!                                │ (batching)      │   bincode     │ UpdateLogService │
//!                                └─────────────────┘               └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`target`] — Multi-part keys naming what an update belongs to
//! - [`row`] — Update rows and their wire shapes
//! - [`codec`] — base64 / Postgres hex transport encodings
//! - [`crdt`] — Thin helpers over Yrs
//! - [`storage`] — Local update log, crud upload queue, live queries
//! - [`provider`] — Binds one Yrs doc to its update rows
//! - [`session`] — Shared, refcounted providers with delayed teardown
//! - [`composition`] — Suppresses update churn while content is rebuilt
//! - [`compaction`] — Merges a target's update rows into one
//! - [`upload`] — Uploads queued crud transactions
//! - [`rpc`] — Update-log RPC surface, client and server
//! - [`service`] — Server-side update-log implementation

pub mod codec;
pub mod compaction;
pub mod composition;
pub mod config;
pub mod crdt;
pub mod hash;
pub mod provider;
pub mod row;
pub mod rpc;
pub mod service;
pub mod session;
pub mod storage;
pub mod target;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

pub use codec::CodecError;
pub use compaction::{compact_target, compact_updates, CompactionError, CompactionReport, TargetLocks};
pub use composition::{content_hash, CompositionGuard};
pub use config::SyncConfig;
pub use crdt::{CrdtError, ProviderId, UpdateOrigin};
pub use provider::{LoadedCallback, ProviderError, UpdateProvider};
pub use row::{UpdateRow, UpdateRowData, UpdateRowInput};
pub use rpc::{RpcClient, RpcError, RpcErrorKind, RpcServer, ServerConfig, UpdateLogRpc};
pub use service::UpdateLogService;
pub use session::{CallbackId, SessionCache, SessionError, SessionLease};
pub use storage::{
    CrudEntry, CrudOp, CrudTransaction, MemoryStore, OpType, QueryDiff, RocksStore, StoreConfig,
    StoreError, UpdateBatch, UpdateStore, UploadQueue, WatchedQuery, WriteKind, WriteSummary,
};
pub use target::TargetKey;
pub use upload::{CodePattern, FatalCodes, UploadConnector, UploadContext, UploadError, UploadOutcome};
