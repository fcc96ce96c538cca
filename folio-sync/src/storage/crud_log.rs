//! Upload-queue bookkeeping.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  CrudLog                     │
//! │                                              │
//! │  [ tx 7: put, delete | tx 8: put | ... ]     │
//! │     ▲                                        │
//! │     └── next_transaction() (oldest first)    │
//! │                                              │
//! │  complete(tx) drops every entry of that tx   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! [`CrudLog`] is the in-memory queue used by `MemoryStore`. [`CrudRecord`]
//! is the checksummed on-disk form used by `RocksStore`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::{CrudEntry, CrudOp, CrudTransaction, OpType, StoreError};
use crate::hash::{fnv1a_32_bytes, FNV_OFFSET_BASIS};

/// In-memory upload queue.
#[derive(Debug, Default)]
pub struct CrudLog {
    entries: VecDeque<CrudEntry>,
    next_seq: u64,
    next_tx: u64,
}

impl CrudLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transaction. Returns its id.
    pub fn append(&mut self, ops: Vec<CrudOp>) -> u64 {
        let tx_id = self.next_tx;
        self.next_tx += 1;
        for op in ops {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.push_back(CrudEntry {
                seq,
                tx_id,
                table: op.table,
                op: op.op,
                id: op.id,
                data: op.data,
            });
        }
        tx_id
    }

    /// Oldest transaction still queued.
    pub fn next_transaction(&self) -> Option<CrudTransaction> {
        let tx_id = self.entries.front()?.tx_id;
        let crud = self
            .entries
            .iter()
            .take_while(|e| e.tx_id == tx_id)
            .cloned()
            .collect();
        Some(CrudTransaction { tx_id, crud })
    }

    /// Drop every entry of `tx_id`. Returns how many were removed.
    pub fn complete(&mut self, tx_id: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.tx_id != tx_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Upload-queue entry as persisted in RocksDB.
///
/// Row data is kept as JSON text; the checksum covers every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrudRecord {
    pub seq: u64,
    pub tx_id: u64,
    pub table: String,
    pub op: OpType,
    pub id: String,
    pub data_json: Option<String>,
    pub checksum: u32,
}

impl CrudRecord {
    pub fn new(seq: u64, tx_id: u64, op: CrudOp) -> Result<Self, StoreError> {
        let data_json = op
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut record = Self {
            seq,
            tx_id,
            table: op.table,
            op: op.op,
            id: op.id,
            data_json,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        Ok(record)
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn compute_checksum(&self) -> u32 {
        let mut hash = fnv1a_32_bytes(FNV_OFFSET_BASIS, &self.seq.to_le_bytes());
        hash = fnv1a_32_bytes(hash, &self.tx_id.to_le_bytes());
        hash = fnv1a_32_bytes(hash, &[self.op as u8]);
        for field in [&self.table, &self.id] {
            hash = fnv1a_32_bytes(hash, &(field.len() as u64).to_le_bytes());
            hash = fnv1a_32_bytes(hash, field.as_bytes());
        }
        if let Some(data) = &self.data_json {
            hash = fnv1a_32_bytes(hash, data.as_bytes());
        }
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    pub fn into_entry(self) -> Result<CrudEntry, StoreError> {
        let data = self
            .data_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(CrudEntry {
            seq: self.seq,
            tx_id: self.tx_id,
            table: self.table,
            op: self.op,
            id: self.id,
            data,
        })
    }
}
