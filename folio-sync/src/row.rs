//! Update-log row shapes.
//!
//! The same logical row exists in three forms:
//! - [`UpdateRow`] — in memory and inside the stores, raw update bytes.
//! - [`UpdateRowData`] — the upload-queue `opData` payload (id travels
//!   separately), base64 text.
//! - [`UpdateRowInput`] — the remote RPC payload, base64 text plus id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::target::TargetKey;

/// One persisted CRDT update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRow {
    /// Client-generated unique id.
    pub id: String,
    pub target: TargetKey,
    /// Tie-breaker for compaction ordering only; never causal.
    pub created_at: DateTime<Utc>,
    /// A single incremental CRDT update.
    pub update_data: Vec<u8>,
}

impl UpdateRow {
    /// New row with a fresh id and the current timestamp.
    pub fn new(target: TargetKey, update_data: Vec<u8>) -> Self {
        Self::with_timestamp(target, update_data, Utc::now())
    }

    /// New row with a fresh id and an explicit timestamp.
    pub fn with_timestamp(
        target: TargetKey,
        update_data: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            created_at,
            update_data,
        }
    }

    /// Upload-queue payload for this row.
    pub fn to_data(&self) -> UpdateRowData {
        UpdateRowData {
            target: self.target.clone(),
            created_at: self.created_at,
            update_data: codec::bytes_to_text(&self.update_data),
        }
    }

    /// Remote RPC payload for this row.
    pub fn to_input(&self) -> UpdateRowInput {
        UpdateRowInput {
            id: self.id.clone(),
            target: self.target.clone(),
            created_at: self.created_at,
            update_data: codec::bytes_to_text(&self.update_data),
        }
    }

    /// Decode an RPC payload. The update accepts base64 or a `\x` hex literal.
    pub fn from_input(input: UpdateRowInput) -> Result<Self, CodecError> {
        Ok(Self {
            update_data: codec::decode_stored(&input.update_data)?,
            id: input.id,
            target: input.target,
            created_at: input.created_at,
        })
    }

    /// Ordering used for every "rows of a target" read: created_at, then id.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Row columns as captured by the local upload queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRowData {
    pub target: TargetKey,
    pub created_at: DateTime<Utc>,
    /// base64
    pub update_data: String,
}

impl UpdateRowData {
    /// Attach the row id carried by the queue entry.
    pub fn with_id(self, id: impl Into<String>) -> UpdateRowInput {
        UpdateRowInput {
            id: id.into(),
            target: self.target,
            created_at: self.created_at,
            update_data: self.update_data,
        }
    }
}

/// Row as sent to the remote `create`/`batch_create` calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRowInput {
    pub id: String,
    pub target: TargetKey,
    pub created_at: DateTime<Utc>,
    /// base64, or a `\x` hex literal
    pub update_data: String,
}
