//! Bridge from the local upload queue to the remote RPC surface.
//!
//! ```text
//!  UploadQueue ── next transaction ──┐
//!                                    ▼
//!                  ┌─────────── for each entry ───────────┐
//!                  │ other table  ──► TableHandler (now)  │
//!                  │ update_log   ──► CreateBatcher (put) │
//!                  │              ──► DeleteBatcher (del) │
//!                  └──────────────────┬───────────────────┘
//!                                     ▼
//!                 flush: batch_create, then batch_delete
//!                                     │
//!            ok / fatal code ─► complete transaction
//!            other failure   ─► keep it, retry the cycle later
//! ```

pub mod batcher;
pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::SyncConfig;
use crate::rpc::{RpcError, UpdateLogRpc};
use crate::storage::{CrudEntry, CrudTransaction, OpType, StoreError, UploadQueue, UPDATE_LOG_TABLE};

pub use batcher::{Batcher, CreateBatcher, DeleteBatcher};
pub use handler::{TableHandler, TableHandlers};

#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("upload rpc failed: {0}")]
    Rpc(#[from] RpcError),
    #[error("upload queue error: {0}")]
    Store(#[from] StoreError),
    /// A bug, not an environmental condition. Never retried.
    #[error("upload invariant violated: {0}")]
    Invariant(String),
}

/// The authenticated user uploads run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadContext {
    pub user_id: String,
}

/// Result of one upload cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing queued.
    Idle,
    Uploaded { tx_id: u64, entries: usize },
    /// Dropped after a fatal response code.
    Discarded { tx_id: u64, code: Option<String> },
}

/// One entry of the fatal response-code table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodePattern {
    /// Every code of a SQLSTATE class, e.g. `23` for `23xxx`.
    Class(String),
    Exact(String),
}

impl CodePattern {
    fn matches(&self, code: &str) -> bool {
        match self {
            CodePattern::Class(class) => code.len() == 5 && code.starts_with(class.as_str()),
            CodePattern::Exact(exact) => code == exact,
        }
    }
}

/// Response codes that make a transaction undeliverable.
#[derive(Debug, Clone, Default)]
pub struct FatalCodes {
    patterns: Vec<CodePattern>,
}

impl FatalCodes {
    /// Empty table: nothing is fatal.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.patterns.push(CodePattern::Class(class.into()));
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.patterns.push(CodePattern::Exact(code.into()));
        self
    }

    /// Data exceptions (`22xxx`), integrity constraint violations (`23xxx`)
    /// and insufficient privilege (`42501`).
    pub fn postgres() -> Self {
        Self::new().class("22").class("23").code("42501")
    }

    pub fn patterns(&self) -> &[CodePattern] {
        &self.patterns
    }

    pub fn is_fatal(&self, error: &RpcError) -> bool {
        error
            .code
            .as_deref()
            .is_some_and(|code| self.patterns.iter().any(|p| p.matches(code)))
    }
}

/// Drives upload cycles against one remote.
pub struct UploadConnector {
    rpc: Arc<dyn UpdateLogRpc>,
    handlers: TableHandlers,
    fatal: FatalCodes,
    context: Option<UploadContext>,
    retry_delay: Duration,
}

impl UploadConnector {
    pub fn new(rpc: Arc<dyn UpdateLogRpc>, config: &SyncConfig) -> Self {
        Self {
            rpc,
            handlers: TableHandlers::new(),
            fatal: FatalCodes::postgres(),
            context: None,
            retry_delay: config.upload_retry_delay,
        }
    }

    pub fn with_handler(mut self, table: impl Into<String>, handler: Arc<dyn TableHandler>) -> Self {
        self.handlers.register(table, handler);
        self
    }

    pub fn with_fatal_codes(mut self, fatal: FatalCodes) -> Self {
        self.fatal = fatal;
        self
    }

    /// Set or clear (sign-out) the authenticated user.
    pub fn set_context(&mut self, context: Option<UploadContext>) {
        self.context = context;
    }

    /// Upload the oldest queued transaction.
    ///
    /// On success, or on a fatal response code, the transaction is
    /// completed. Any other failure leaves it queued and is returned.
    pub async fn upload_data(&self, queue: &dyn UploadQueue) -> Result<UploadOutcome, UploadError> {
        let Some(transaction) = queue.next_crud_transaction()? else {
            return Ok(UploadOutcome::Idle);
        };
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| UploadError::Invariant("upload attempted without an authenticated user".into()))?;

        let tx_id = transaction.tx_id;
        let entries = transaction.crud.len();
        match self.upload_transaction(&transaction, context).await {
            Ok(()) => {
                queue.complete_transaction(tx_id)?;
                log::debug!("upload transaction {tx_id} done ({entries} entries)");
                Ok(UploadOutcome::Uploaded { tx_id, entries })
            }
            Err(UploadError::Rpc(e)) if self.fatal.is_fatal(&e) => {
                log::error!(
                    "discarding upload transaction {tx_id} ({entries} entries) after fatal error: {e}"
                );
                queue.complete_transaction(tx_id)?;
                Ok(UploadOutcome::Discarded { tx_id, code: e.code })
            }
            Err(e) => Err(e),
        }
    }

    /// [`upload_data`](Self::upload_data), retrying failed cycles after the
    /// configured delay. Invariant violations return immediately.
    pub async fn upload_with_retry(&self, queue: &dyn UploadQueue) -> Result<UploadOutcome, UploadError> {
        let mut attempt = 1u32;
        loop {
            match self.upload_data(queue).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ UploadError::Invariant(_)) => return Err(e),
                Err(e) => {
                    log::warn!(
                        "upload attempt {attempt} failed: {e}; retrying in {:?}",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Upload until the queue is empty. Returns the outcomes in order.
    pub async fn drain(&self, queue: &dyn UploadQueue) -> Result<Vec<UploadOutcome>, UploadError> {
        let mut outcomes = Vec::new();
        loop {
            match self.upload_with_retry(queue).await? {
                UploadOutcome::Idle => return Ok(outcomes),
                outcome => outcomes.push(outcome),
            }
        }
    }

    async fn upload_transaction(
        &self,
        transaction: &CrudTransaction,
        context: &UploadContext,
    ) -> Result<(), UploadError> {
        let mut batchers: Vec<Box<dyn Batcher>> =
            vec![Box::new(CreateBatcher::new()), Box::new(DeleteBatcher::new())];

        for entry in &transaction.crud {
            if entry.table != UPDATE_LOG_TABLE {
                self.upload_entry(entry, context).await?;
                continue;
            }
            let batcher = batchers
                .iter_mut()
                .find(|b| b.matches(entry.op))
                .ok_or_else(|| {
                    UploadError::Invariant(format!(
                        "unsupported {:?} on {UPDATE_LOG_TABLE} row {}",
                        entry.op, entry.id
                    ))
                })?;
            batcher.collect(entry)?;
        }

        for batcher in &mut batchers {
            batcher.flush(self.rpc.as_ref()).await?;
        }
        Ok(())
    }

    async fn upload_entry(&self, entry: &CrudEntry, context: &UploadContext) -> Result<(), UploadError> {
        let handler = self.handlers.get(&entry.table).ok_or_else(|| {
            UploadError::Invariant(format!("no upload handler for table {}", entry.table))
        })?;
        let data = || {
            entry.data.as_ref().ok_or_else(|| {
                UploadError::Invariant(format!("{:?} on {} row {} carries no data", entry.op, entry.table, entry.id))
            })
        };
        match entry.op {
            OpType::Put => handler.put(&entry.id, data()?, context).await?,
            OpType::Patch => handler.patch(&entry.id, data()?, context).await?,
            OpType::Delete => handler.remove(&entry.id, context).await?,
        }
        Ok(())
    }
}
