//! Durable update-log storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   write(batch, Local)    ┌──────────────────────────┐
//! │UpdateProvider│ ───────────────────────► │ UpdateStore              │
//! │ (per target) │ ◄─────────────────────── │ (MemoryStore/RocksStore) │
//! └──────────────┘   QueryDiff (watch)      └──────┬─────────────┬─────┘
//!                                                  │             │
//!                                   Local writes   │             │ rows
//!                                                  ▼             ▼
//!                                        ┌──────────────┐  ┌──────────────┐
//!                                        │ UploadQueue  │  │ updates      │
//!                                        │ (crud log)   │  │ update_ids   │
//!                                        └──────────────┘  └──────────────┘
//! ```
//!
//! Every write is one atomic batch. A batch either applies completely
//! (rows, upload-queue entries and watch notifications) or not at all.

pub mod crud_log;
pub mod memory;
pub mod rocks;
pub mod watch;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::compaction::TargetLocks;
use crate::row::UpdateRow;
use crate::target::TargetKey;

pub use crud_log::CrudLog;
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};
pub use watch::WatchRegistry;

/// Name of the update-log table as seen by the upload queue.
pub const UPDATE_LOG_TABLE: &str = "update_log";

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("row id already exists: {0}")]
    DuplicateId(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupted upload-queue record at sequence {0}")]
    Corrupted(u64),
    #[error("unknown upload transaction {0}")]
    UnknownTransaction(u64),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Who authored a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Authored on this replica; recorded in the upload queue.
    Local,
    /// Already durable upstream (server-side log, downloaded rows); not queued.
    Replicated,
}

/// One operation inside an [`UpdateBatch`].
#[derive(Debug, Clone)]
pub enum UpdateOp {
    Insert(UpdateRow),
    /// Delete rows by id. Unknown ids are skipped.
    Delete(Vec<String>),
    /// Delete every row of a target.
    DeleteTarget(TargetKey),
}

/// Ordered list of operations applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    ops: Vec<UpdateOp>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, row: UpdateRow) -> Self {
        self.ops.push(UpdateOp::Insert(row));
        self
    }

    pub fn delete(mut self, ids: Vec<String>) -> Self {
        if !ids.is_empty() {
            self.ops.push(UpdateOp::Delete(ids));
        }
        self
    }

    pub fn delete_target(mut self, target: TargetKey) -> Self {
        self.ops.push(UpdateOp::DeleteTarget(target));
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Row counts affected by one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: usize,
    pub deleted: usize,
}

/// Change to the result set of a watched target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDiff {
    /// `true` until the initial result set has been delivered.
    pub is_loading: bool,
    pub added: Vec<UpdateRow>,
    /// Ids of removed rows.
    pub removed: Vec<String>,
}

impl QueryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Live subscription to the rows of one target.
///
/// The first diff carries the rows present at registration time with
/// `is_loading == false`. Dropping the query unsubscribes it.
pub struct WatchedQuery {
    rx: mpsc::UnboundedReceiver<QueryDiff>,
}

impl WatchedQuery {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<QueryDiff>) -> Self {
        Self { rx }
    }

    /// Next diff, or `None` once the store is gone.
    pub async fn next_diff(&mut self) -> Option<QueryDiff> {
        self.rx.recv().await
    }

    /// Diff already buffered, if any.
    pub fn try_next_diff(&mut self) -> Option<QueryDiff> {
        self.rx.try_recv().ok()
    }
}

/// Upload-queue operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Put,
    Patch,
    Delete,
}

/// A local mutation waiting to be recorded in the upload queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudOp {
    pub table: String,
    pub op: OpType,
    pub id: String,
    /// Row columns for `Put`/`Patch`; `None` for `Delete`.
    pub data: Option<serde_json::Value>,
}

impl CrudOp {
    pub fn put(table: impl Into<String>, id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            op: OpType::Put,
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn patch(table: impl Into<String>, id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            op: OpType::Patch,
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            op: OpType::Delete,
            id: id.into(),
            data: None,
        }
    }
}

/// One recorded upload-queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudEntry {
    /// Global order of the entry in the queue.
    pub seq: u64,
    pub tx_id: u64,
    pub table: String,
    pub op: OpType,
    pub id: String,
    pub data: Option<serde_json::Value>,
}

/// All entries written by one local transaction, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudTransaction {
    pub tx_id: u64,
    pub crud: Vec<CrudEntry>,
}

/// Durable, watchable log of CRDT update rows.
///
/// Implementations must be safe to share across tasks. Calls are
/// synchronous; they never block on anything but local storage.
pub trait UpdateStore: Send + Sync {
    /// Apply a batch atomically.
    fn write(&self, batch: UpdateBatch, kind: WriteKind) -> Result<WriteSummary, StoreError>;

    /// Rows of a target ordered by `(created_at, id)`.
    fn rows(&self, target: &TargetKey) -> Result<Vec<UpdateRow>, StoreError>;

    fn contains(&self, id: &str) -> Result<bool, StoreError>;

    /// Subscribe to the rows of a target.
    fn watch(&self, target: &TargetKey) -> Result<WatchedQuery, StoreError>;

    /// Per-target advisory locks serializing compactions on this store.
    fn target_locks(&self) -> &TargetLocks;
}

/// Ordered queue of committed local writes awaiting upload.
pub trait UploadQueue: Send + Sync {
    /// Record local mutations of ordinary tables as one transaction.
    fn record(&self, ops: Vec<CrudOp>) -> Result<u64, StoreError>;

    /// Oldest transaction not yet completed.
    fn next_crud_transaction(&self) -> Result<Option<CrudTransaction>, StoreError>;

    /// Remove a transaction from the queue.
    fn complete_transaction(&self, tx_id: u64) -> Result<(), StoreError>;

    /// Number of queued entries.
    fn pending_count(&self) -> Result<usize, StoreError>;
}

/// Effect of a batch on the row set.
#[derive(Debug, Clone)]
pub(crate) enum RowChange {
    Inserted(UpdateRow),
    Removed(UpdateRow),
}

impl RowChange {
    fn target(&self) -> &TargetKey {
        match self {
            RowChange::Inserted(row) | RowChange::Removed(row) => &row.target,
        }
    }
}

/// Resolve a batch against the current rows.
///
/// `lookup` finds a committed row by id, `target_rows` lists a target's
/// committed rows. Rows inserted earlier in the same batch are visible to
/// later operations. Fails with [`StoreError::DuplicateId`] if any insert
/// collides with an existing id.
pub(crate) fn resolve_batch<L, T>(
    batch: &UpdateBatch,
    lookup: L,
    target_rows: T,
) -> Result<Vec<RowChange>, StoreError>
where
    L: Fn(&str) -> Result<Option<UpdateRow>, StoreError>,
    T: Fn(&TargetKey) -> Result<Vec<UpdateRow>, StoreError>,
{
    // id -> Some(row) if present after the ops so far, None if removed
    let mut overlay: HashMap<String, Option<UpdateRow>> = HashMap::new();
    let mut changes: Vec<RowChange> = Vec::new();

    let current = |overlay: &HashMap<String, Option<UpdateRow>>, id: &str| match overlay.get(id) {
        Some(state) => Ok(state.clone()),
        None => lookup(id),
    };

    for op in batch.ops() {
        match op {
            UpdateOp::Insert(row) => {
                if current(&overlay, &row.id)?.is_some() {
                    return Err(StoreError::DuplicateId(row.id.clone()));
                }
                overlay.insert(row.id.clone(), Some(row.clone()));
                changes.push(RowChange::Inserted(row.clone()));
            }
            UpdateOp::Delete(ids) => {
                for id in ids {
                    if let Some(row) = current(&overlay, id)? {
                        remove_change(&mut changes, row);
                        overlay.insert(id.clone(), None);
                    }
                }
            }
            UpdateOp::DeleteTarget(target) => {
                let mut doomed: Vec<UpdateRow> = target_rows(target)?
                    .into_iter()
                    .filter(|row| !matches!(overlay.get(&row.id), Some(None)))
                    .collect();
                // Rows inserted earlier in this batch.
                doomed.extend(
                    overlay
                        .values()
                        .flatten()
                        .filter(|row| &row.target == target)
                        .cloned(),
                );
                for row in doomed {
                    let id = row.id.clone();
                    remove_change(&mut changes, row);
                    overlay.insert(id, None);
                }
            }
        }
    }

    Ok(changes)
}

/// Record a removal, cancelling an insert of the same row from this batch.
fn remove_change(changes: &mut Vec<RowChange>, row: UpdateRow) {
    let inserted_here = changes
        .iter()
        .position(|c| matches!(c, RowChange::Inserted(r) if r.id == row.id));
    match inserted_here {
        Some(index) => {
            changes.remove(index);
        }
        None => changes.push(RowChange::Removed(row)),
    }
}

pub(crate) fn summarize(changes: &[RowChange]) -> WriteSummary {
    let mut summary = WriteSummary::default();
    for change in changes {
        match change {
            RowChange::Inserted(_) => summary.inserted += 1,
            RowChange::Removed(_) => summary.deleted += 1,
        }
    }
    summary
}

/// Upload-queue ops for a committed local batch.
pub(crate) fn crud_ops(changes: &[RowChange]) -> Result<Vec<CrudOp>, StoreError> {
    changes
        .iter()
        .map(|change| match change {
            RowChange::Inserted(row) => {
                let data = serde_json::to_value(row.to_data())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(CrudOp::put(UPDATE_LOG_TABLE, row.id.clone(), data))
            }
            RowChange::Removed(row) => Ok(CrudOp::delete(UPDATE_LOG_TABLE, row.id.clone())),
        })
        .collect()
}

/// Per-target diffs for a committed batch, in first-touched order.
pub(crate) fn diffs_by_target(changes: Vec<RowChange>) -> Vec<(TargetKey, QueryDiff)> {
    let mut diffs: Vec<(TargetKey, QueryDiff)> = Vec::new();
    for change in changes {
        let index = match diffs.iter().position(|(t, _)| t == change.target()) {
            Some(index) => index,
            None => {
                diffs.push((change.target().clone(), QueryDiff::default()));
                diffs.len() - 1
            }
        };
        let diff = &mut diffs[index].1;
        match change {
            RowChange::Inserted(row) => diff.added.push(row),
            RowChange::Removed(row) => diff.removed.push(row.id),
        }
    }
    diffs
}
