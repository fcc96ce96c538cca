//! Upload handlers for ordinary (non update-log) tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::UploadContext;
use crate::rpc::RpcError;

/// Uploads single-row mutations of one table.
#[async_trait]
pub trait TableHandler: Send + Sync {
    async fn put(&self, id: &str, data: &serde_json::Value, context: &UploadContext) -> Result<(), RpcError>;

    async fn patch(&self, id: &str, data: &serde_json::Value, context: &UploadContext) -> Result<(), RpcError>;

    async fn remove(&self, id: &str, context: &UploadContext) -> Result<(), RpcError>;
}

/// Table name → handler.
#[derive(Clone, Default)]
pub struct TableHandlers {
    handlers: HashMap<String, Arc<dyn TableHandler>>,
}

impl TableHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: impl Into<String>, handler: Arc<dyn TableHandler>) {
        self.handlers.insert(table.into(), handler);
    }

    pub fn get(&self, table: &str) -> Option<&Arc<dyn TableHandler>> {
        self.handlers.get(table)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
