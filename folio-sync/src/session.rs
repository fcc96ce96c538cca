//! Reference-counted cache of live document sessions.
//!
//! One [`Doc`] per target, shared by every consumer that acquires it. The
//! cache owns the document and its provider; consumers only borrow. When
//! the last reference is released a grace timer starts, and the session is
//! torn down only if nobody re-acquired it in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use yrs::Doc;

use crate::compaction::CompactionReport;
use crate::composition::CompositionGuard;
use crate::config::SyncConfig;
use crate::crdt::ProviderId;
use crate::provider::{LoadedCallback, ProviderError, UpdateProvider};
use crate::row::UpdateRow;
use crate::storage::UpdateStore;
use crate::target::TargetKey;

/// Identifies a deferred loaded callback so `release` can drop it.
pub type CallbackId = u64;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// What a consumer gets from [`SessionCache::acquire`].
#[derive(Clone)]
pub struct SessionLease {
    pub doc: Doc,
    /// Set when the loaded callback was deferred; hand it back to `release`.
    pub callback: Option<CallbackId>,
}

struct Session {
    doc: Doc,
    provider: Option<UpdateProvider>,
    refs: usize,
    loaded: bool,
    pending_loaded: Vec<(CallbackId, LoadedCallback)>,
    cleanup: Option<JoinHandle<()>>,
    /// Bumped whenever a new provider is attached.
    generation: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            doc: Doc::new(),
            provider: None,
            refs: 0,
            loaded: false,
            pending_loaded: Vec::new(),
            cleanup: None,
            generation: 0,
        }
    }

    fn cancel_cleanup(&mut self) {
        if let Some(timer) = self.cleanup.take() {
            timer.abort();
        }
    }

    fn teardown(mut self) {
        self.cancel_cleanup();
        if let Some(mut provider) = self.provider.take() {
            provider.destroy();
        }
    }
}

struct CacheInner {
    sessions: Mutex<HashMap<TargetKey, Session>>,
    config: SyncConfig,
    composition: CompositionGuard,
    runtime: Handle,
    next_callback: AtomicU64,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<TargetKey, Session>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Provider `generation` of `target` finished loading.
    fn mark_loaded(&self, target: &TargetKey, generation: u64) {
        let callbacks = {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(target) else {
                return;
            };
            if session.generation != generation {
                return;
            }
            session.loaded = true;
            std::mem::take(&mut session.pending_loaded)
        };
        log::debug!("session {target} loaded ({} waiting callbacks)", callbacks.len());
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Evict `target` if it is still unreferenced.
    fn evict_if_idle(&self, target: &TargetKey) {
        let evicted = {
            let mut sessions = self.lock();
            match sessions.get(target) {
                Some(session) if session.refs == 0 => sessions.remove(target),
                _ => None,
            }
        };
        if let Some(mut session) = evicted {
            // This runs on the cleanup task itself.
            session.cleanup = None;
            session.teardown();
            log::info!("session {target} evicted after grace period");
        }
    }
}

fn same_store(a: &Arc<dyn UpdateStore>, b: &Arc<dyn UpdateStore>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Cache of document sessions keyed by target.
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<CacheInner>,
}

impl SessionCache {
    /// Must be called within a tokio runtime.
    pub fn new(config: SyncConfig) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                sessions: Mutex::new(HashMap::new()),
                config,
                composition: CompositionGuard::new(),
                runtime,
                next_callback: AtomicU64::new(0),
            }),
        })
    }

    pub fn composition(&self) -> &CompositionGuard {
        &self.inner.composition
    }

    /// Take a reference on the session for `target`.
    ///
    /// Attaches a provider bound to `store`, replacing the current one if it
    /// is bound to a different store. `on_loaded` runs immediately when the
    /// session is already loaded, otherwise once loading completes.
    pub fn acquire(
        &self,
        store: Arc<dyn UpdateStore>,
        target: &TargetKey,
        on_loaded: Option<LoadedCallback>,
    ) -> Result<SessionLease, SessionError> {
        let mut ready = None;
        let lease = {
            let mut sessions = self.inner.lock();
            let session = sessions.entry(target.clone()).or_insert_with(Session::new);

            let rebind = match &session.provider {
                Some(provider) => !same_store(provider.store(), &store),
                None => true,
            };
            if rebind {
                if let Some(mut old) = session.provider.take() {
                    log::info!("session {target} switching storage");
                    old.destroy();
                }
                session.loaded = false;
                session.generation += 1;

                let generation = session.generation;
                let cache: Weak<CacheInner> = Arc::downgrade(&self.inner);
                let key = target.clone();
                let provider_loaded: LoadedCallback = Box::new(move || {
                    if let Some(cache) = cache.upgrade() {
                        cache.mark_loaded(&key, generation);
                    }
                });
                session.provider = Some(UpdateProvider::new(
                    session.doc.clone(),
                    store,
                    target.clone(),
                    self.inner.composition.clone(),
                    &self.inner.config,
                    Some(provider_loaded),
                )?);
            }

            session.refs += 1;
            session.cancel_cleanup();

            let callback = match on_loaded {
                Some(callback) if session.loaded => {
                    ready = Some(callback);
                    None
                }
                Some(callback) => {
                    let id = self.inner.next_callback.fetch_add(1, Ordering::SeqCst);
                    session.pending_loaded.push((id, callback));
                    Some(id)
                }
                None => None,
            };
            log::debug!("session {target} acquired ({} refs)", session.refs);

            SessionLease {
                doc: session.doc.clone(),
                callback,
            }
        };

        if let Some(callback) = ready {
            callback();
        }
        Ok(lease)
    }

    /// Drop a reference on `target`, with the callback id from its lease.
    pub fn release(&self, target: &TargetKey, callback: Option<CallbackId>) {
        let mut sessions = self.inner.lock();
        let Some(session) = sessions.get_mut(target) else {
            return;
        };

        session.refs = session.refs.saturating_sub(1);
        if let Some(id) = callback {
            session.pending_loaded.retain(|(pending, _)| *pending != id);
        }
        log::debug!("session {target} released ({} refs)", session.refs);

        if session.refs == 0 {
            session.cancel_cleanup();
            let cache = Arc::downgrade(&self.inner);
            let key = target.clone();
            let delay = self.inner.config.cleanup_delay;
            session.cleanup = Some(self.inner.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(cache) = cache.upgrade() {
                    cache.evict_if_idle(&key);
                }
            }));
        }
    }

    /// Document for `target`, created if absent. Leaves refcounts alone.
    pub fn get_document(&self, target: &TargetKey) -> Doc {
        let mut sessions = self.inner.lock();
        sessions
            .entry(target.clone())
            .or_insert_with(Session::new)
            .doc
            .clone()
    }

    /// Persist a snapshot through the bound provider, if any.
    pub fn flush_snapshot(
        &self,
        target: &TargetKey,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<UpdateRow>, SessionError> {
        let sessions = self.inner.lock();
        match sessions.get(target).and_then(|s| s.provider.as_ref()) {
            Some(provider) => Ok(Some(provider.store_snapshot(state_vector)?)),
            None => Ok(None),
        }
    }

    /// Compact the local log of `target` through the bound provider.
    pub fn gc_updates(&self, target: &TargetKey) -> Result<CompactionReport, SessionError> {
        let sessions = self.inner.lock();
        match sessions.get(target).and_then(|s| s.provider.as_ref()) {
            Some(provider) => Ok(provider.gc_local_updates()?),
            None => Ok(CompactionReport::noop(target.clone())),
        }
    }

    /// Start composition on `target`. `content` is the serialized document tree.
    pub fn begin_composition(&self, target: &TargetKey, content: &serde_json::Value) {
        let doc = self.get_document(target);
        self.inner.composition.begin(target, &doc, content);
    }

    /// End composition on `target`, persisting its delta if the content changed.
    pub fn end_composition(
        &self,
        target: &TargetKey,
        content: &serde_json::Value,
    ) -> Result<Option<UpdateRow>, SessionError> {
        match self.inner.composition.finish(target, content) {
            Some(state_vector) => self.flush_snapshot(target, Some(&state_vector)),
            None => Ok(None),
        }
    }

    /// Tear down every session now, skipping grace periods.
    pub fn clear_all(&self) {
        let sessions: Vec<(TargetKey, Session)> = self.inner.lock().drain().collect();
        let count = sessions.len();
        for (_, session) in sessions {
            session.teardown();
        }
        log::info!("cleared {count} sessions");
    }

    pub fn refs(&self, target: &TargetKey) -> usize {
        self.inner.lock().get(target).map(|s| s.refs).unwrap_or(0)
    }

    pub fn is_loaded(&self, target: &TargetKey) -> bool {
        self.inner.lock().get(target).map(|s| s.loaded).unwrap_or(false)
    }

    pub fn contains(&self, target: &TargetKey) -> bool {
        self.inner.lock().contains_key(target)
    }

    /// Id of the provider bound to `target`.
    pub fn provider_id(&self, target: &TargetKey) -> Option<ProviderId> {
        self.inner
            .lock()
            .get(target)
            .and_then(|s| s.provider.as_ref().map(UpdateProvider::id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
