//! Process-wide map of [`MatchId`] to live matches (spec §4.6).

use std::sync::Arc;

use duel_ids::MatchId;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::MatchRuntime;

/// The only way to mutate a match: wraps a per-match mutex so at most one
/// caller drives a given match's tick loop or `submit_action` at a time
/// (spec §4.6 "single-writer semantics via a per-match mutual-exclusion
/// primitive").
#[derive(Clone)]
pub struct Handle(Arc<Mutex<MatchRuntime>>);

impl Handle {
    /// Acquires exclusive access to the underlying [`MatchRuntime`].
    ///
    /// Suspends until any other caller currently holding the lock releases
    /// it; per spec §5 this is bounded to roughly one tick's worth of work.
    pub async fn lock(&self) -> MutexGuard<'_, MatchRuntime> {
        self.0.lock().await
    }
}

/// Process-wide registry of active matches.
#[derive(Default)]
pub struct MatchRegistry {
    matches: FxHashMap<MatchId, Handle>,
}

impl MatchRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `runtime` under its own [`MatchId`] and returns a [`Handle`] to it.
    pub fn insert(&mut self, runtime: MatchRuntime) -> Handle {
        let match_id = runtime.match_id();
        let handle = Handle(Arc::new(Mutex::new(runtime)));
        self.matches.insert(match_id, handle.clone());
        handle
    }

    /// Returns a handle to the match with the given id, if it is still registered.
    #[must_use]
    pub fn get(&self, match_id: MatchId) -> Option<Handle> {
        self.matches.get(&match_id).cloned()
    }

    /// Removes a match from the registry, e.g. once settlement has completed.
    pub fn drop_match(&mut self, match_id: MatchId) -> Option<Handle> {
        self.matches.remove(&match_id)
    }

    /// Iterates over every currently registered `(MatchId, Handle)` pair.
    ///
    /// Handles are cheap `Arc` clones; a driving loop collects this before
    /// awaiting each match's lock, since `FxHashMap`'s iterator can't be held
    /// across an `.await`.
    pub fn handles(&self) -> impl Iterator<Item = (MatchId, Handle)> + '_ {
        self.matches.iter().map(|(id, handle)| (*id, handle.clone()))
    }

    /// Number of matches currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// `true` if no matches are currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}
