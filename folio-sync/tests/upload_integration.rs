//! Upload integration tests.
//!
//! Verifies:
//! - Local update rows reach the authoritative log
//! - A compaction uploads its snapshot before deleting the rows it replaces
//! - Fatal response codes discard the transaction
//! - Transport failures keep the transaction and are retried
//! - A retry after a partly uploaded compaction still converges
//! - Ordinary tables go through their registered handler
//! - Broken transactions surface as invariant errors

use folio_sync::crdt;
use folio_sync::rpc::{BatchCreateResponse, BatchDeleteResponse, GcRequest, GcResponse};
use folio_sync::upload::TableHandler;
use folio_sync::{
    compact_target, CrudOp, MemoryStore, RpcError, SyncConfig, TargetKey, UpdateBatch,
    UpdateLogRpc, UpdateLogService, UpdateRow, UpdateRowInput, UpdateStore, UploadConnector,
    UploadContext, UploadError, UploadOutcome, UploadQueue, WriteKind,
};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use yrs::{Doc, GetString, ReadTxn, Text, Transact};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// The authoritative service, with scripted failures and a call log.
///
/// A failure scripted for a method waits for that method; one scripted
/// with no method hits the next call.
struct ScriptedRemote {
    service: UpdateLogService,
    failures: Mutex<VecDeque<(Option<&'static str>, RpcError)>>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedRemote {
    fn new() -> (Arc<MemoryStore>, Arc<Self>) {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(Self {
            service: UpdateLogService::new(store.clone(), 200),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        });
        (store, remote)
    }

    fn fail_next(&self, error: RpcError) {
        self.failures.lock().unwrap().push_back((None, error));
    }

    fn fail_on(&self, method: &'static str, error: RpcError) {
        self.failures.lock().unwrap().push_back((Some(method), error));
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self, method: &'static str) -> Result<(), RpcError> {
        self.calls.lock().unwrap().push(method);
        let mut failures = self.failures.lock().unwrap();
        let due = matches!(failures.front(), Some((scripted, _)) if scripted.map_or(true, |m| m == method));
        if due {
            Err(failures.pop_front().unwrap().1)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UpdateLogRpc for ScriptedRemote {
    async fn create(&self, row: UpdateRowInput) -> Result<(), RpcError> {
        self.enter("create")?;
        self.service.create(row).await
    }

    async fn batch_create(&self, rows: Vec<UpdateRowInput>) -> Result<BatchCreateResponse, RpcError> {
        self.enter("batch_create")?;
        self.service.batch_create(rows).await
    }

    async fn batch_delete(&self, ids: Vec<String>) -> Result<BatchDeleteResponse, RpcError> {
        self.enter("batch_delete")?;
        self.service.batch_delete(ids).await
    }

    async fn gc(&self, request: GcRequest) -> Result<GcResponse, RpcError> {
        self.enter("gc")?;
        self.service.gc(request).await
    }
}

/// Records every call it receives.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl TableHandler for RecordingHandler {
    async fn put(&self, id: &str, data: &serde_json::Value, context: &UploadContext) -> Result<(), RpcError> {
        self.seen
            .lock()
            .unwrap()
            .push(format!("put {id} {data} as {}", context.user_id));
        Ok(())
    }

    async fn patch(&self, id: &str, data: &serde_json::Value, _context: &UploadContext) -> Result<(), RpcError> {
        self.seen.lock().unwrap().push(format!("patch {id} {data}"));
        Ok(())
    }

    async fn remove(&self, id: &str, _context: &UploadContext) -> Result<(), RpcError> {
        self.seen.lock().unwrap().push(format!("remove {id}"));
        Ok(())
    }
}

fn connector(remote: Arc<ScriptedRemote>) -> UploadConnector {
    let mut connector = UploadConnector::new(remote, &SyncConfig::for_testing());
    connector.set_context(Some(UploadContext {
        user_id: "user-1".into(),
    }));
    connector
}

/// Write one local row per word, each an incremental update of the same doc.
fn write_words(store: &MemoryStore, target: &TargetKey, words: &[&str]) -> Doc {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    for word in words {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let len = text.len(&txn);
            text.insert(&mut txn, len, word);
        }
        let update = doc.transact().encode_diff_v1(&before);
        let row = UpdateRow::new(target.clone(), update);
        store
            .write(UpdateBatch::new().insert(row), WriteKind::Local)
            .unwrap();
    }
    doc
}

fn replay(store: &dyn UpdateStore, target: &TargetKey) -> String {
    let doc = Doc::new();
    for row in store.rows(target).unwrap() {
        crdt::apply_update(&doc, &row.update_data, None).unwrap();
    }
    let text = doc.get_or_insert_text("content");
    let txn = doc.transact();
    text.get_string(&txn)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_local_rows_reach_server() {
    let local = MemoryStore::new();
    let (server, remote) = ScriptedRemote::new();
    let target = TargetKey::entity("note", "1");
    write_words(&local, &target, &["hello ", "world"]);

    let outcomes = connector(remote.clone()).drain(&local).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0], UploadOutcome::Uploaded { entries: 1, .. }));
    assert_eq!(local.pending_count().unwrap(), 0);

    assert_eq!(server.rows(&target).unwrap(), local.rows(&target).unwrap());
    assert_eq!(replay(server.as_ref(), &target), "hello world");
    assert_eq!(remote.calls(), vec!["batch_create", "batch_create"]);
}

#[tokio::test]
async fn test_compaction_uploads_snapshot_before_deletes() {
    let local = MemoryStore::new();
    let (server, remote) = ScriptedRemote::new();
    let target = TargetKey::document("doc-1");
    write_words(&local, &target, &["a", "b", "c"]);
    let connector = connector(remote.clone());
    connector.drain(&local).await.unwrap();

    compact_target(&local, &target, WriteKind::Local, 2).unwrap();
    let outcome = connector.upload_data(&local).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Uploaded { entries: 4, .. }));

    let calls = remote.calls();
    assert_eq!(&calls[calls.len() - 2..], &["batch_create", "batch_delete"]);
    assert_eq!(server.rows(&target).unwrap().len(), 1);
    assert_eq!(replay(server.as_ref(), &target), "abc");
}

#[tokio::test]
async fn test_duplicate_row_is_discarded() {
    let local = MemoryStore::new();
    let (server, remote) = ScriptedRemote::new();
    let target = TargetKey::entity("note", "2");
    write_words(&local, &target, &["dup"]);

    // The server already holds other content under the same id.
    let mut existing = local.rows(&target).unwrap().remove(0);
    existing.update_data = vec![0, 0];
    server
        .write(UpdateBatch::new().insert(existing), WriteKind::Replicated)
        .unwrap();

    let outcome = connector(remote).upload_data(&local).await.unwrap();
    match outcome {
        UploadOutcome::Discarded { code, .. } => assert_eq!(code.as_deref(), Some("23505")),
        other => panic!("expected discard, got {other:?}"),
    }
    assert_eq!(local.pending_count().unwrap(), 0);
    assert_eq!(server.rows(&target).unwrap().len(), 1);
}

#[tokio::test]
async fn test_transport_failure_is_retried() {
    let local = MemoryStore::new();
    let (server, remote) = ScriptedRemote::new();
    let target = TargetKey::entity("note", "3");
    write_words(&local, &target, &["retry"]);
    let connector = connector(remote.clone());

    remote.fail_next(RpcError::transport("batch_create: timed out"));
    let err = connector.upload_data(&local).await.unwrap_err();
    assert!(matches!(err, UploadError::Rpc(_)));
    assert_eq!(local.pending_count().unwrap(), 1, "transaction stays queued");

    remote.fail_next(RpcError::transport("connection reset"));
    remote.fail_next(RpcError::rejected("40001", "serialization failure"));
    let outcome = connector.upload_with_retry(&local).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Uploaded { .. }));
    assert_eq!(remote.calls().len(), 4);
    assert_eq!(server.rows(&target).unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_after_partial_compaction_upload() {
    let local = MemoryStore::new();
    let (server, remote) = ScriptedRemote::new();
    let target = TargetKey::document("doc-2");
    write_words(&local, &target, &["a", "b", "c"]);
    let connector = connector(remote.clone());
    connector.drain(&local).await.unwrap();

    compact_target(&local, &target, WriteKind::Local, 2).unwrap();
    remote.fail_on("batch_delete", RpcError::transport("connection reset"));
    let outcome = connector.upload_with_retry(&local).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Uploaded { entries: 4, .. }));

    let calls = remote.calls();
    assert_eq!(
        &calls[calls.len() - 4..],
        &["batch_create", "batch_delete", "batch_create", "batch_delete"]
    );
    assert_eq!(local.pending_count().unwrap(), 0);
    assert_eq!(server.rows(&target).unwrap(), local.rows(&target).unwrap());
    assert_eq!(replay(server.as_ref(), &target), "abc");
}

#[tokio::test]
async fn test_ordinary_tables_use_handlers() {
    let local = MemoryStore::new();
    let (_, remote) = ScriptedRemote::new();
    let handler = Arc::new(RecordingHandler::default());
    let connector = connector(remote.clone()).with_handler("notes", handler.clone());

    local
        .record(vec![
            CrudOp::put("notes", "n1", serde_json::json!({ "title": "a" })),
            CrudOp::patch("notes", "n1", serde_json::json!({ "title": "b" })),
            CrudOp::delete("notes", "n1"),
        ])
        .unwrap();

    let outcome = connector.upload_data(&local).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Uploaded { entries: 3, .. }));
    assert_eq!(
        *handler.seen.lock().unwrap(),
        vec![
            r#"put n1 {"title":"a"} as user-1"#.to_string(),
            r#"patch n1 {"title":"b"}"#.to_string(),
            "remove n1".to_string(),
        ]
    );
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn test_invariant_violations_are_not_retried() {
    let local = MemoryStore::new();
    let (_, remote) = ScriptedRemote::new();

    local
        .record(vec![CrudOp::put("tags", "t1", serde_json::json!({}))])
        .unwrap();
    let err = connector(remote.clone())
        .upload_with_retry(&local)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Invariant(_)));
    assert_eq!(local.pending_count().unwrap(), 1);

    let mut signed_out = connector(remote);
    signed_out.set_context(None);
    assert!(matches!(
        signed_out.upload_data(&local).await,
        Err(UploadError::Invariant(_))
    ));
}

#[tokio::test]
async fn test_update_log_patch_is_rejected() {
    let local = MemoryStore::new();
    let (_, remote) = ScriptedRemote::new();
    local
        .record(vec![CrudOp::patch(
            folio_sync::storage::UPDATE_LOG_TABLE,
            "row-1",
            serde_json::json!({}),
        )])
        .unwrap();

    let err = connector(remote).upload_data(&local).await.unwrap_err();
    assert!(matches!(err, UploadError::Invariant(_)));
}

#[tokio::test]
async fn test_empty_queue_is_idle() {
    let local = MemoryStore::new();
    let (_, remote) = ScriptedRemote::new();
    let outcome = connector(remote.clone()).upload_data(&local).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Idle);
    assert!(remote.calls().is_empty());
}
