//! Per-operation batching of update-log uploads.
//!
//! Batchers are built fresh for every upload cycle, so a retried cycle
//! re-collects from the full transaction without double counting.

use async_trait::async_trait;

use super::UploadError;
use crate::row::{UpdateRowData, UpdateRowInput};
use crate::rpc::UpdateLogRpc;
use crate::storage::{CrudEntry, OpType};

/// Accumulates update-log entries of one operation type into one RPC.
#[async_trait]
pub trait Batcher: Send {
    fn matches(&self, op: OpType) -> bool;

    fn collect(&mut self, entry: &CrudEntry) -> Result<(), UploadError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Issue the batched call. Empty batches issue nothing.
    async fn flush(&mut self, rpc: &dyn UpdateLogRpc) -> Result<(), UploadError>;
}

/// Inserts, uploaded with one `batch_create`.
#[derive(Debug, Default)]
pub struct CreateBatcher {
    rows: Vec<UpdateRowInput>,
}

impl CreateBatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Batcher for CreateBatcher {
    fn matches(&self, op: OpType) -> bool {
        op == OpType::Put
    }

    fn collect(&mut self, entry: &CrudEntry) -> Result<(), UploadError> {
        let data = entry.data.clone().ok_or_else(|| {
            UploadError::Invariant(format!("update-log put {} carries no data", entry.id))
        })?;
        let data: UpdateRowData = serde_json::from_value(data).map_err(|e| {
            UploadError::Invariant(format!("update-log put {} has invalid data: {e}", entry.id))
        })?;
        self.rows.push(data.with_id(entry.id.clone()));
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    async fn flush(&mut self, rpc: &dyn UpdateLogRpc) -> Result<(), UploadError> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows);
        let count = rows.len();
        let response = rpc.batch_create(rows).await?;
        log::debug!("uploaded {count} update rows ({} created)", response.created);
        Ok(())
    }
}

/// Deletions, uploaded with one `batch_delete` of row ids.
#[derive(Debug, Default)]
pub struct DeleteBatcher {
    ids: Vec<String>,
}

impl DeleteBatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Batcher for DeleteBatcher {
    fn matches(&self, op: OpType) -> bool {
        op == OpType::Delete
    }

    fn collect(&mut self, entry: &CrudEntry) -> Result<(), UploadError> {
        self.ids.push(entry.id.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    async fn flush(&mut self, rpc: &dyn UpdateLogRpc) -> Result<(), UploadError> {
        if self.ids.is_empty() {
            return Ok(());
        }
        let ids = std::mem::take(&mut self.ids);
        let count = ids.len();
        let response = rpc.batch_delete(ids).await?;
        log::debug!("deleted {count} update rows upstream ({} existed)", response.deleted);
        Ok(())
    }
}
