//! The index and catalog of one shard, replaced together.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::art::RadixIndex;
use crate::catalog::DocumentCatalog;

/// Everything a shard knows about the crawl.
#[derive(Debug, Default)]
pub struct ShardState {
    /// Word → document ids.
    pub index: RadixIndex,
    /// Url ↔ id ↔ document.
    pub catalog: DocumentCatalog,
}

impl ShardState {
    /// An empty shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair an index with its catalog.
    pub fn from_parts(index: RadixIndex, catalog: DocumentCatalog) -> Self {
        Self { index, catalog }
    }
}

/// Handle through which workers, queries and checkpoints see the current state.
///
/// A peer pull builds a complete [`ShardState`] and stores it in one step;
/// readers holding the previous state finish against it undisturbed.
pub type SharedState = Arc<ArcSwap<ShardState>>;

/// Wrap a state for sharing.
pub fn share(state: ShardState) -> SharedState {
    Arc::new(ArcSwap::from_pointee(state))
}
