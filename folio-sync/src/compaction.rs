//! Update-log compaction.
//!
//! Collapses every row of one target into a single row carrying the
//! equivalent CRDT state:
//!
//! ```text
//!  lock(target) ─► read rows (created_at asc) ─► apply to GC doc
//!       │                                             │
//!       │          ┌──────────────────────────────────┘
//!       ▼          ▼
//!  one batch: delete old ids (chunked) + insert compacted row ─► unlock
//! ```
//!
//! The same routine runs client-side (local log, `WriteKind::Local`, so the
//! result flows through the upload queue) and server-side (authoritative
//! log, `WriteKind::Replicated`).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crdt::{self, CrdtError};
use crate::row::UpdateRow;
use crate::storage::{StoreError, UpdateBatch, UpdateStore, WriteKind};
use crate::target::TargetKey;

#[derive(Debug, Clone, Error)]
pub enum CompactionError {
    #[error("compaction storage error: {0}")]
    Store(#[from] StoreError),
    #[error("compaction crdt error: {0}")]
    Crdt(#[from] CrdtError),
}

/// Advisory locks keyed by [`TargetKey::lock_id`].
///
/// Held for the duration of one compaction. Unrelated targets that share a
/// lock id merely serialize.
#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for a target. Lock it to enter the critical section.
    pub fn handle(&self, target: &TargetKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(target.lock_id()).or_default().clone()
    }
}

/// Result of compacting one set of rows.
#[derive(Debug, Clone)]
pub struct CompactedUpdate {
    /// Full state of all input rows as one update.
    pub update: Vec<u8>,
    /// Latest `created_at` among the inputs.
    pub latest_created_at: DateTime<Utc>,
    /// Ids of the compacted rows.
    pub ids: Vec<String>,
}

/// Outcome of a compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub target: TargetKey,
    /// Rows replaced by the compacted row (0 when there was nothing to do).
    pub compacted: usize,
}

impl CompactionReport {
    pub fn noop(target: TargetKey) -> Self {
        Self {
            target,
            compacted: 0,
        }
    }

    pub fn summary(&self) -> String {
        format!("{} update rows compacted for {}", self.compacted, self.target)
    }
}

impl fmt::Display for CompactionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Merge rows into one update. `None` when there is at most one row.
pub fn compact_updates(rows: &[UpdateRow]) -> Result<Option<CompactedUpdate>, CrdtError> {
    if rows.len() <= 1 {
        return Ok(None);
    }

    let doc = crdt::gc_document();
    for row in rows {
        crdt::apply_update(&doc, &row.update_data, None)?;
    }
    let update = crdt::encode_state_as_update(&doc, None)?;

    let latest_created_at = rows
        .iter()
        .map(|r| r.created_at)
        .max()
        .unwrap_or_else(Utc::now);

    Ok(Some(CompactedUpdate {
        update,
        latest_created_at,
        ids: rows.iter().map(|r| r.id.clone()).collect(),
    }))
}

/// Compact every row of `target` in `store` into one.
///
/// Serialized per target through the store's [`TargetLocks`]. Deletes are
/// issued in chunks of `delete_chunk` ids but committed together with the
/// compacted insert as one batch.
pub fn compact_target(
    store: &dyn UpdateStore,
    target: &TargetKey,
    kind: WriteKind,
    delete_chunk: usize,
) -> Result<CompactionReport, CompactionError> {
    let handle = store.target_locks().handle(target);
    let _guard = handle.lock().unwrap_or_else(|p| p.into_inner());

    let rows = store.rows(target)?;
    let Some(compacted) = compact_updates(&rows)? else {
        log::debug!("nothing to compact for {target} ({} rows)", rows.len());
        return Ok(CompactionReport::noop(target.clone()));
    };

    let count = compacted.ids.len();
    let mut batch = UpdateBatch::new();
    for chunk in compacted.ids.chunks(delete_chunk.max(1)) {
        batch = batch.delete(chunk.to_vec());
    }
    let row = UpdateRow::with_timestamp(
        target.clone(),
        compacted.update,
        compacted.latest_created_at,
    );
    batch = batch.insert(row);
    store.write(batch, kind)?;

    let report = CompactionReport {
        target: target.clone(),
        compacted: count,
    };
    log::info!("{}", report.summary());
    Ok(report)
}
