//! Fan-out of row changes to watched queries.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{QueryDiff, WatchedQuery};
use crate::row::UpdateRow;
use crate::target::TargetKey;

/// Watchers grouped by target.
///
/// Closed watchers are pruned on the next notification of their target and
/// on every registration.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    watchers: Mutex<HashMap<TargetKey, Vec<mpsc::UnboundedSender<QueryDiff>>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher whose first diff is `initial`.
    ///
    /// Callers hold their write lock across reading `initial` and this call
    /// so no commit can slip between the two.
    pub fn register(&self, target: &TargetKey, initial: Vec<UpdateRow>) -> WatchedQuery {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(QueryDiff {
            is_loading: false,
            added: initial,
            removed: Vec::new(),
        });
        let mut watchers = self.watchers.lock().unwrap_or_else(|p| p.into_inner());
        watchers.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        watchers.entry(target.clone()).or_default().push(tx);
        log::debug!("watch registered for {target}");
        WatchedQuery::new(rx)
    }

    /// Deliver a diff to every live watcher of `target`.
    pub fn notify(&self, target: &TargetKey, diff: QueryDiff) {
        if diff.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock().unwrap_or_else(|p| p.into_inner());
        let Some(senders) = watchers.get_mut(target) else {
            return;
        };
        senders.retain(|tx| tx.send(diff.clone()).is_ok());
        if senders.is_empty() {
            watchers.remove(target);
        }
    }

    /// Number of live watchers for a target.
    pub fn watcher_count(&self, target: &TargetKey) -> usize {
        let watchers = self.watchers.lock().unwrap_or_else(|p| p.into_inner());
        watchers
            .get(target)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
