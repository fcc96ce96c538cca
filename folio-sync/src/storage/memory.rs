//! In-memory update store.
//!
//! Suits tests and local-only sessions that never need to survive a
//! restart. All state sits behind one mutex, so each batch is trivially
//! atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{
    crud_ops, diffs_by_target, resolve_batch, summarize, CrudLog, CrudOp, CrudTransaction,
    RowChange, StoreError, UpdateBatch, UpdateStore, UploadQueue, WatchRegistry, WatchedQuery,
    WriteKind, WriteSummary,
};
use crate::compaction::TargetLocks;
use crate::row::UpdateRow;
use crate::target::TargetKey;

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<String, UpdateRow>,
    /// target -> (created_at micros, id) -> id
    by_target: HashMap<TargetKey, BTreeMap<(i64, String), String>>,
    crud: CrudLog,
}

impl MemoryState {
    fn target_rows(&self, target: &TargetKey) -> Vec<UpdateRow> {
        self.by_target
            .get(target)
            .map(|index| {
                index
                    .values()
                    .filter_map(|id| self.rows.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply(&mut self, change: &RowChange) {
        match change {
            RowChange::Inserted(row) => {
                self.by_target
                    .entry(row.target.clone())
                    .or_default()
                    .insert(index_key(row), row.id.clone());
                self.rows.insert(row.id.clone(), row.clone());
            }
            RowChange::Removed(row) => {
                self.rows.remove(&row.id);
                if let Some(index) = self.by_target.get_mut(&row.target) {
                    index.remove(&index_key(row));
                    if index.is_empty() {
                        self.by_target.remove(&row.target);
                    }
                }
            }
        }
    }
}

fn index_key(row: &UpdateRow) -> (i64, String) {
    (row.created_at.timestamp_micros(), row.id.clone())
}

/// Update store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    watchers: WatchRegistry,
    locks: TargetLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across all targets.
    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl UpdateStore for MemoryStore {
    fn write(&self, batch: UpdateBatch, kind: WriteKind) -> Result<WriteSummary, StoreError> {
        let mut state = self.lock();
        let changes = resolve_batch(
            &batch,
            |id| Ok(state.rows.get(id).cloned()),
            |target| Ok(state.target_rows(target)),
        )?;
        let ops = match kind {
            WriteKind::Local => crud_ops(&changes)?,
            WriteKind::Replicated => Vec::new(),
        };

        for change in &changes {
            state.apply(change);
        }
        if !ops.is_empty() {
            let tx_id = state.crud.append(ops);
            log::trace!("upload transaction {tx_id} recorded");
        }

        let summary = summarize(&changes);
        for (target, diff) in diffs_by_target(changes) {
            self.watchers.notify(&target, diff);
        }
        Ok(summary)
    }

    fn rows(&self, target: &TargetKey) -> Result<Vec<UpdateRow>, StoreError> {
        Ok(self.lock().target_rows(target))
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().rows.contains_key(id))
    }

    fn watch(&self, target: &TargetKey) -> Result<WatchedQuery, StoreError> {
        let state = self.lock();
        Ok(self.watchers.register(target, state.target_rows(target)))
    }

    fn target_locks(&self) -> &TargetLocks {
        &self.locks
    }
}

impl UploadQueue for MemoryStore {
    fn record(&self, ops: Vec<CrudOp>) -> Result<u64, StoreError> {
        Ok(self.lock().crud.append(ops))
    }

    fn next_crud_transaction(&self) -> Result<Option<CrudTransaction>, StoreError> {
        Ok(self.lock().crud.next_transaction())
    }

    fn complete_transaction(&self, tx_id: u64) -> Result<(), StoreError> {
        match self.lock().crud.complete(tx_id) {
            0 => Err(StoreError::UnknownTransaction(tx_id)),
            _ => Ok(()),
        }
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock().crud.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpType, UPDATE_LOG_TABLE};
    use chrono::{Duration, Utc};

    #[test]
    fn test_rows_ordered_by_created_at_then_id() {
        let store = MemoryStore::new();
        let target = TargetKey::document("d");
        let now = Utc::now();
        let late = UpdateRow::with_timestamp(target.clone(), vec![1], now);
        let early = UpdateRow::with_timestamp(target.clone(), vec![2], now - Duration::seconds(5));
        let mut tie_a = UpdateRow::with_timestamp(target.clone(), vec![3], now);
        tie_a.id = "0000".into();

        store
            .write(
                UpdateBatch::new().insert(late.clone()).insert(early.clone()).insert(tie_a.clone()),
                WriteKind::Replicated,
            )
            .unwrap();

        let ids: Vec<String> = store.rows(&target).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, tie_a.id, late.id]);
    }

    #[test]
    fn test_local_writes_enter_upload_queue() {
        let store = MemoryStore::new();
        let target = TargetKey::document("d");
        let row = UpdateRow::new(target.clone(), vec![1]);

        store.write(UpdateBatch::new().insert(row.clone()), WriteKind::Local).unwrap();
        store
            .write(UpdateBatch::new().insert(UpdateRow::new(target.clone(), vec![2])), WriteKind::Replicated)
            .unwrap();
        assert_eq!(store.pending_count().unwrap(), 1);

        let tx = store.next_crud_transaction().unwrap().unwrap();
        assert_eq!(tx.crud[0].table, UPDATE_LOG_TABLE);
        assert_eq!(tx.crud[0].op, OpType::Put);
        assert_eq!(tx.crud[0].id, row.id);

        store.complete_transaction(tx.tx_id).unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);
        assert!(store.complete_transaction(tx.tx_id).is_err());
    }

    #[test]
    fn test_duplicate_batch_leaves_store_untouched() {
        let store = MemoryStore::new();
        let target = TargetKey::document("d");
        let existing = UpdateRow::new(target.clone(), vec![1]);
        store.write(UpdateBatch::new().insert(existing.clone()), WriteKind::Local).unwrap();

        let fresh = UpdateRow::new(target.clone(), vec![2]);
        let result = store.write(
            UpdateBatch::new().insert(fresh.clone()).insert(existing),
            WriteKind::Local,
        );
        assert!(matches!(result, Err(StoreError::DuplicateId(_))));
        assert!(!store.contains(&fresh.id).unwrap());
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_watch_sees_initial_rows_and_inserts() {
        let store = MemoryStore::new();
        let target = TargetKey::document("d");
        let first = UpdateRow::new(target.clone(), vec![1]);
        store.write(UpdateBatch::new().insert(first.clone()), WriteKind::Local).unwrap();

        let mut query = store.watch(&target).unwrap();
        let initial = query.next_diff().await.unwrap();
        assert!(!initial.is_loading);
        assert_eq!(initial.added, vec![first.clone()]);

        let second = UpdateRow::new(target.clone(), vec![2]);
        store.write(UpdateBatch::new().insert(second.clone()), WriteKind::Local).unwrap();
        assert_eq!(query.next_diff().await.unwrap().added, vec![second]);

        store.write(UpdateBatch::new().delete_target(target.clone()), WriteKind::Local).unwrap();
        let removed = query.next_diff().await.unwrap().removed;
        assert_eq!(removed.len(), 2);
        assert!(store.rows(&target).unwrap().is_empty());
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn test_record_other_tables() {
        let store = MemoryStore::new();
        let tx = store
            .record(vec![CrudOp::put("notes", "n1", serde_json::json!({"title": "t"}))])
            .unwrap();
        let next = store.next_crud_transaction().unwrap().unwrap();
        assert_eq!(next.tx_id, tx);
        assert_eq!(next.crud[0].table, "notes");
    }
}
