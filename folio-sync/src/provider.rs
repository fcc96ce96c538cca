//! Update provider: keeps one CRDT document in sync with one target's
//! update log.
//!
//! ```text
//!            local edit                       watched query
//!  Doc ──────────────────► pending ──► timer ──► UpdateStore
//!   ▲   (origin != ours)   (merge)   (300ms)       │
//!   │                                              │ added rows
//!   └──────────── apply (origin = ours) ◄──────────┘
//! ```
//!
//! Lifecycle: construction registers the watch and the document observer
//! (loading). The first diff with `is_loading == false` fires the loaded
//! callback once (loaded). Local updates are then queued and persisted on
//! the throttle timer (active). [`UpdateProvider::destroy`] aborts the
//! watch, detaches the observer and flushes whatever is still queued
//! (destroyed).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::{Doc, Origin, Subscription};

use crate::compaction::{self, CompactionError, CompactionReport};
use crate::composition::CompositionGuard;
use crate::config::SyncConfig;
use crate::crdt::{self, CrdtError, ProviderId, UpdateOrigin};
use crate::row::UpdateRow;
use crate::storage::{StoreError, UpdateBatch, UpdateStore, WatchedQuery, WriteKind};
use crate::target::TargetKey;

/// Invoked once, when the initial rows have been applied.
pub type LoadedCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider storage error: {0}")]
    Store(#[from] StoreError),
    #[error("provider crdt error: {0}")]
    Crdt(#[from] CrdtError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error("failed to observe document updates: {0}")]
    Observe(String),
    #[error("no tokio runtime available")]
    NoRuntime,
}

#[derive(Default)]
struct PendingQueue {
    updates: Vec<Vec<u8>>,
    timer: Option<JoinHandle<()>>,
}

struct ProviderShared {
    id: ProviderId,
    target: TargetKey,
    store: Arc<dyn UpdateStore>,
    composition: CompositionGuard,
    origin: Origin,
    throttle: Duration,
    gc_delete_chunk: usize,
    runtime: Handle,
    queue: Mutex<PendingQueue>,
    synced: watch::Sender<bool>,
    destroyed: AtomicBool,
}

impl ProviderShared {
    fn lock_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Document observer body. Runs while the transaction commits, so it
    /// must not open transactions of its own.
    fn on_document_update(self: &Arc<Self>, origin: Option<&Origin>, update: &[u8]) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let UpdateOrigin::Remote(_) = UpdateOrigin::classify(origin, self.id, &self.origin) {
            return;
        }
        if self.composition.is_composing(&self.target) {
            log::trace!("dropping update for {} during composition", self.target);
            return;
        }

        let mut queue = self.lock_queue();
        queue.updates.push(update.to_vec());
        log::trace!("queued update for {} ({} pending)", self.target, queue.updates.len());
        if queue.timer.is_none() {
            let shared = Arc::clone(self);
            queue.timer = Some(self.runtime.spawn(async move {
                tokio::time::sleep(shared.throttle).await;
                shared.lock_queue().timer = None;
                if let Err(e) = shared.flush() {
                    log::warn!("throttled flush for {} failed: {e}", shared.target);
                }
            }));
        }
    }

    /// Merge and persist everything queued as one row.
    ///
    /// On failure the updates are put back at the front of the queue.
    fn flush(&self) -> Result<Option<UpdateRow>, ProviderError> {
        let updates = std::mem::take(&mut self.lock_queue().updates);
        if updates.is_empty() {
            return Ok(None);
        }

        let result = crdt::merge_updates(&updates)
            .map_err(ProviderError::from)
            .and_then(|merged| {
                let row = UpdateRow::new(self.target.clone(), merged);
                self.store
                    .write(UpdateBatch::new().insert(row.clone()), WriteKind::Local)?;
                Ok(row)
            });

        match result {
            Ok(row) => {
                log::debug!(
                    "persisted {} merged updates for {} as row {}",
                    updates.len(),
                    self.target,
                    row.id
                );
                Ok(Some(row))
            }
            Err(e) => {
                let mut queue = self.lock_queue();
                let newer = std::mem::replace(&mut queue.updates, updates);
                queue.updates.extend(newer);
                Err(e)
            }
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.lock_queue().timer.take() {
            timer.abort();
        }
    }
}

/// Applies the watched rows of a target to the document.
async fn apply_watched_rows(
    shared: Arc<ProviderShared>,
    doc: Doc,
    mut query: WatchedQuery,
    mut on_loaded: Option<LoadedCallback>,
) {
    while let Some(diff) = query.next_diff().await {
        for row in &diff.added {
            if let Err(e) = crdt::apply_update(&doc, &row.update_data, Some(shared.origin.clone())) {
                log::warn!("skipping update row {} for {}: {e}", row.id, shared.target);
            }
        }
        if !diff.is_loading && !*shared.synced.borrow() {
            shared.synced.send_replace(true);
            log::info!("provider {} loaded {}", shared.id, shared.target);
            if let Some(callback) = on_loaded.take() {
                callback();
            }
        }
    }
    log::debug!("watch for {} closed", shared.target);
}

/// Binds one document to one target's update log.
pub struct UpdateProvider {
    shared: Arc<ProviderShared>,
    doc: Doc,
    subscription: Option<Subscription>,
    watch_abort: AbortHandle,
}

impl UpdateProvider {
    /// Attach `doc` to the update log of `target` in `store`.
    ///
    /// Must be called within a tokio runtime; the watch and the throttle
    /// timer run as tasks on it.
    pub fn new(
        doc: Doc,
        store: Arc<dyn UpdateStore>,
        target: TargetKey,
        composition: CompositionGuard,
        config: &SyncConfig,
        on_loaded: Option<LoadedCallback>,
    ) -> Result<Self, ProviderError> {
        let runtime = Handle::try_current().map_err(|_| ProviderError::NoRuntime)?;
        let id = Uuid::new_v4();
        let (synced, _) = watch::channel(false);
        let shared = Arc::new(ProviderShared {
            id,
            origin: crdt::provider_origin(id),
            target,
            store,
            composition,
            throttle: config.throttle,
            gc_delete_chunk: config.gc_delete_chunk,
            runtime,
            queue: Mutex::new(PendingQueue::default()),
            synced,
            destroyed: AtomicBool::new(false),
        });

        let query = shared.store.watch(&shared.target)?;

        let observer = Arc::clone(&shared);
        let subscription = doc
            .observe_update_v1(move |txn, event| {
                observer.on_document_update(txn.origin(), &event.update);
            })
            .map_err(|e| ProviderError::Observe(e.to_string()))?;

        let (watch_abort, registration) = AbortHandle::new_pair();
        let task = Abortable::new(
            apply_watched_rows(Arc::clone(&shared), doc.clone(), query, on_loaded),
            registration,
        );
        shared.runtime.spawn(async move {
            let _ = task.await;
        });

        log::info!("provider {id} attached to {}", shared.target);
        Ok(Self {
            shared,
            doc,
            subscription: Some(subscription),
            watch_abort,
        })
    }

    pub fn id(&self) -> ProviderId {
        self.shared.id
    }

    pub fn target(&self) -> &TargetKey {
        &self.shared.target
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn store(&self) -> &Arc<dyn UpdateStore> {
        &self.shared.store
    }

    /// Whether the initial rows have been applied.
    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Resolves once the initial rows have been applied.
    pub fn when_synced(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.synced.subscribe();
        async move {
            let _ = rx.wait_for(|synced| *synced).await;
        }
    }

    /// Number of local updates waiting for the throttle timer.
    pub fn pending_len(&self) -> usize {
        self.shared.lock_queue().updates.len()
    }

    /// Persist queued updates now instead of waiting for the timer.
    pub fn flush_pending(&self) -> Result<Option<UpdateRow>, ProviderError> {
        self.shared.cancel_timer();
        self.shared.flush()
    }

    /// Persist the document state, or its delta from `state_vector`, as a
    /// new row immediately.
    pub fn store_snapshot(&self, state_vector: Option<&[u8]>) -> Result<UpdateRow, ProviderError> {
        let update = crdt::encode_state_as_update(&self.doc, state_vector)?;
        let row = UpdateRow::new(self.shared.target.clone(), update);
        self.shared
            .store
            .write(UpdateBatch::new().insert(row.clone()), WriteKind::Local)?;
        log::debug!("stored snapshot row {} for {}", row.id, self.shared.target);
        Ok(row)
    }

    /// Erase every row of the target.
    ///
    /// Edits still waiting for the throttle are dropped, not written: after
    /// this call the log holds nothing from before it.
    ///
    /// Independent of [`destroy`](Self::destroy).
    pub fn delete_data(&self) -> Result<usize, ProviderError> {
        self.shared.cancel_timer();
        self.shared.lock_queue().updates.clear();
        let summary = self.shared.store.write(
            UpdateBatch::new().delete_target(self.shared.target.clone()),
            WriteKind::Local,
        )?;
        log::info!("deleted {} update rows for {}", summary.deleted, self.shared.target);
        Ok(summary.deleted)
    }

    /// Flush, then compact the local log of the target.
    ///
    /// The compaction is a local write, so it reaches the upload queue as
    /// one transaction.
    pub fn gc_local_updates(&self) -> Result<CompactionReport, ProviderError> {
        self.flush_pending()?;
        let report = compaction::compact_target(
            self.shared.store.as_ref(),
            &self.shared.target,
            WriteKind::Local,
            self.shared.gc_delete_chunk,
        )?;
        Ok(report)
    }

    /// Tear down. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watch_abort.abort();
        self.subscription.take();
        self.shared.cancel_timer();
        if let Err(e) = self.shared.flush() {
            log::warn!("final flush for {} failed: {e}", self.shared.target);
        }
        log::info!("provider {} detached from {}", self.shared.id, self.shared.target);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for UpdateProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, UploadQueue};
    use crate::test_support::{append_text, read_text};
    use std::sync::atomic::AtomicUsize;

    fn provider_for(store: &Arc<MemoryStore>, target: &TargetKey) -> (Doc, UpdateProvider) {
        let doc = Doc::new();
        let provider = UpdateProvider::new(
            doc.clone(),
            store.clone(),
            target.clone(),
            CompositionGuard::new(),
            &SyncConfig::for_testing(),
            None,
        )
        .unwrap();
        (doc, provider)
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_merges_into_one_row() {
        let store = Arc::new(MemoryStore::new());
        let target = TargetKey::document("d");
        let (doc, provider) = provider_for(&store, &target);
        provider.when_synced().await;

        for word in ["a", "b", "c", "d", "e"] {
            append_text(&doc, word);
        }
        assert_eq!(provider.pending_len(), 5);
        assert!(store.rows(&target).unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(350)).await;
        let rows = store.rows(&target).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(provider.pending_len(), 0);

        let copy = Doc::new();
        crdt::apply_update(&copy, &rows[0].update_data, None).unwrap();
        assert_eq!(read_text(&copy), "abcde");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_existing_rows_once() {
        let store = Arc::new(MemoryStore::new());
        let target = TargetKey::document("d");
        let source = Doc::new();
        append_text(&source, "persisted");
        let row = UpdateRow::new(target.clone(), crdt::encode_state_as_update(&source, None).unwrap());
        store.write(UpdateBatch::new().insert(row), WriteKind::Replicated).unwrap();

        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let doc = Doc::new();
        let provider = UpdateProvider::new(
            doc.clone(),
            store.clone(),
            target.clone(),
            CompositionGuard::new(),
            &SyncConfig::for_testing(),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        provider.when_synced().await;
        assert!(provider.is_synced());
        assert_eq!(read_text(&doc), "persisted");

        // Rows applied from the log are not persisted again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.rows(&target).unwrap().len(), 1);
        assert_eq!(store.pending_count().unwrap(), 0);

        // Later rows are applied without refiring the loaded callback.
        let other = Doc::new();
        append_text(&other, "!");
        let update = crdt::encode_state_as_update(&other, None).unwrap();
        store
            .write(UpdateBatch::new().insert(UpdateRow::new(target.clone(), update)), WriteKind::Replicated)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(read_text(&doc).len(), "persisted!".len());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_composition_drops_updates() {
        let store = Arc::new(MemoryStore::new());
        let target = TargetKey::document("d");
        let composition = CompositionGuard::new();
        let doc = Doc::new();
        let provider = UpdateProvider::new(
            doc.clone(),
            store.clone(),
            target.clone(),
            composition.clone(),
            &SyncConfig::for_testing(),
            None,
        )
        .unwrap();
        provider.when_synced().await;

        composition.begin(&target, &doc, &serde_json::json!(""));
        append_text(&doc, "n");
        append_text(&doc, "i");
        assert_eq!(provider.pending_len(), 0);

        let sv = composition.finish(&target, &serde_json::json!("ni")).unwrap();
        provider.store_snapshot(Some(&sv)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.rows(&target).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_flushes_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let target = TargetKey::document("d");
        let (doc, mut provider) = provider_for(&store, &target);
        provider.when_synced().await;

        append_text(&doc, "unsaved");
        provider.destroy();
        provider.destroy();
        assert!(provider.is_destroyed());
        assert_eq!(store.rows(&target).unwrap().len(), 1);

        // Detached: further edits are not queued.
        append_text(&doc, " more");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.rows(&target).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_data_and_gc() {
        let store = Arc::new(MemoryStore::new());
        let target = TargetKey::document("d");
        let (doc, provider) = provider_for(&store, &target);
        provider.when_synced().await;

        for word in ["one", "two", "three"] {
            append_text(&doc, word);
            provider.flush_pending().unwrap();
        }
        append_text(&doc, "four");
        let report = provider.gc_local_updates().unwrap();
        assert_eq!(report.compacted, 4);
        assert_eq!(store.rows(&target).unwrap().len(), 1);

        append_text(&doc, "five");
        assert_eq!(provider.pending_len(), 1);
        assert_eq!(provider.delete_data().unwrap(), 1);
        assert_eq!(provider.pending_len(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.rows(&target).unwrap().is_empty());
    }

    #[test]
    fn test_requires_runtime() {
        let store: Arc<dyn UpdateStore> = Arc::new(MemoryStore::new());
        let result = UpdateProvider::new(
            Doc::new(),
            store,
            TargetKey::document("d"),
            CompositionGuard::new(),
            &SyncConfig::default(),
            None,
        );
        assert!(matches!(result, Err(ProviderError::NoRuntime)));
    }
}
