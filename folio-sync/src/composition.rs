//! Input-method composition tracking.
//!
//! While a target is composing, providers drop its local updates instead of
//! queueing them. When composition ends, the delta since composition start
//! is persisted as one snapshot, unless the content did not change.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use yrs::Doc;

use crate::crdt;
use crate::hash::fnv1a_32;
use crate::target::TargetKey;

/// Stable hash of a serialized document tree.
pub fn content_hash(content: &serde_json::Value) -> u32 {
    let serialized = serde_json::to_string(content).unwrap_or_default();
    fnv1a_32(&serialized)
}

#[derive(Debug, Default)]
struct CompositionState {
    composing: HashSet<TargetKey>,
    state_vectors: HashMap<TargetKey, Vec<u8>>,
    hashes: HashMap<TargetKey, u32>,
}

/// Shared composition state for every target of a session cache.
///
/// Cloning is cheap; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CompositionGuard {
    state: Arc<Mutex<CompositionState>>,
}

impl CompositionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `target` as composing and capture its current state.
    pub fn begin(&self, target: &TargetKey, doc: &Doc, content: &serde_json::Value) {
        let state_vector = crdt::encode_state_vector(doc);
        let hash = content_hash(content);
        let mut state = self.lock();
        state.composing.insert(target.clone());
        state.state_vectors.insert(target.clone(), state_vector);
        state.hashes.insert(target.clone(), hash);
        log::trace!("composition started for {target}");
    }

    /// Unmark `target`.
    ///
    /// Returns the state vector captured at `begin` when the content hash
    /// changed, i.e. when a snapshot relative to it should be persisted.
    pub fn finish(&self, target: &TargetKey, content: &serde_json::Value) -> Option<Vec<u8>> {
        let mut state = self.lock();
        state.composing.remove(target);
        let saved_hash = state.hashes.remove(target);
        let state_vector = state.state_vectors.remove(target)?;

        if saved_hash == Some(content_hash(content)) {
            log::trace!("composition for {target} left content unchanged");
            return None;
        }
        Some(state_vector)
    }

    pub fn is_composing(&self, target: &TargetKey) -> bool {
        self.lock().composing.contains(target)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CompositionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
