//! Server side of the update-log RPC surface.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::CodecError;
use crate::compaction::{self, CompactionError};
use crate::row::{UpdateRow, UpdateRowInput};
use crate::rpc::{
    BatchCreateResponse, BatchDeleteResponse, GcRequest, GcResponse, RpcError, UpdateLogRpc,
};
use crate::storage::{StoreError, UpdateBatch, UpdateStore, WriteKind};

/// Response code for an insert colliding with an existing row id.
pub const UNIQUE_VIOLATION: &str = "23505";
/// Response code for an update payload that is neither base64 nor hex.
pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";

fn store_error(e: StoreError) -> RpcError {
    match e {
        StoreError::DuplicateId(id) => {
            RpcError::rejected(UNIQUE_VIOLATION, format!("duplicate update id {id}"))
        }
        other => RpcError::server(other.to_string()),
    }
}

fn codec_error(e: CodecError) -> RpcError {
    RpcError::rejected(INVALID_TEXT_REPRESENTATION, e.to_string())
}

/// Authoritative update log backed by any [`UpdateStore`].
///
/// Writes are replicated writes: the server has no upload queue.
pub struct UpdateLogService {
    store: Arc<dyn UpdateStore>,
    delete_chunk: usize,
}

impl UpdateLogService {
    pub fn new(store: Arc<dyn UpdateStore>, delete_chunk: usize) -> Self {
        Self {
            store,
            delete_chunk,
        }
    }

    pub fn store(&self) -> &Arc<dyn UpdateStore> {
        &self.store
    }

    /// Drop rows already stored byte for byte, e.g. re-sent after a lost
    /// response. A stored row with the same id but other content is a
    /// unique violation.
    fn without_replays(&self, rows: Vec<UpdateRow>) -> Result<Vec<UpdateRow>, RpcError> {
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.store.contains(&row.id).map_err(store_error)? {
                fresh.push(row);
                continue;
            }
            let stored = self.store.rows(&row.target).map_err(store_error)?;
            match stored.iter().find(|r| r.id == row.id) {
                Some(existing) if existing.update_data == row.update_data => {
                    log::debug!("batch_create skipped stored row {}", row.id);
                }
                _ => return Err(store_error(StoreError::DuplicateId(row.id))),
            }
        }
        Ok(fresh)
    }
}

#[async_trait]
impl UpdateLogRpc for UpdateLogService {
    async fn create(&self, row: UpdateRowInput) -> Result<(), RpcError> {
        let row = UpdateRow::from_input(row).map_err(codec_error)?;
        log::debug!("create {} for {}", row.id, row.target);
        self.store
            .write(UpdateBatch::new().insert(row), WriteKind::Replicated)
            .map_err(store_error)?;
        Ok(())
    }

    async fn batch_create(&self, rows: Vec<UpdateRowInput>) -> Result<BatchCreateResponse, RpcError> {
        let rows = rows
            .into_iter()
            .map(UpdateRow::from_input)
            .collect::<Result<Vec<_>, _>>()
            .map_err(codec_error)?;
        let rows = self.without_replays(rows)?;
        if rows.is_empty() {
            return Ok(BatchCreateResponse { created: 0 });
        }

        let batch = rows
            .into_iter()
            .fold(UpdateBatch::new(), |batch, row| batch.insert(row));
        let summary = self
            .store
            .write(batch, WriteKind::Replicated)
            .map_err(store_error)?;
        log::debug!("batch_create stored {} rows", summary.inserted);
        Ok(BatchCreateResponse {
            created: summary.inserted,
        })
    }

    async fn batch_delete(&self, ids: Vec<String>) -> Result<BatchDeleteResponse, RpcError> {
        if ids.is_empty() {
            return Ok(BatchDeleteResponse { deleted: 0 });
        }
        let summary = self
            .store
            .write(UpdateBatch::new().delete(ids), WriteKind::Replicated)
            .map_err(store_error)?;
        log::debug!("batch_delete removed {} rows", summary.deleted);
        Ok(BatchDeleteResponse {
            deleted: summary.deleted,
        })
    }

    async fn gc(&self, request: GcRequest) -> Result<GcResponse, RpcError> {
        let store = self.store.clone();
        let chunk = self.delete_chunk;
        // The target lock blocks; keep it off the async workers.
        let report = tokio::task::spawn_blocking(move || {
            compaction::compact_target(store.as_ref(), &request.target, WriteKind::Replicated, chunk)
        })
        .await
        .map_err(|e| RpcError::server(format!("gc task failed: {e}")))?
        .map_err(|e| match e {
            CompactionError::Store(e) => store_error(e),
            CompactionError::Crdt(e) => RpcError::server(e.to_string()),
        })?;

        Ok(GcResponse {
            success: report.summary(),
        })
    }
}
