//! Concurrent Adaptive Radix Tree mapping words to posting lists.
//!
//! Based on "The Adaptive Radix Tree: ARTful Indexing for Main-Memory Databases"
//! by Leis et al., 2013, without path compression: one byte per level.
//!
//! Key features:
//! - Adaptive node sizes (4, 16, 48, 256 children)
//! - One reader/writer lock per node, finds take shared locks only
//! - Growing a node swaps the parent slot while the old node stays locked
//!
//! ## Upgrade hand-off
//!
//! When a writer finds its node full it builds the wider copy and gets the
//! old node's write guard back from [`NodeCell::insert_key`]. Holding that
//! guard, it locks the parent (or the root slot), checks the slot still
//! points at the old node, swaps it, marks the old node retired and only
//! then lets go. Anyone who later locks a retired node restarts from the
//! root. Locks are always taken child first, then parent.

mod debug;
mod node;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::IndexError;

pub use node::{DocId, Node, NodeCell, NodeRef, NodeType, Postings};
pub(crate) use node::KeyInsert;

/// Shape statistics for a [`RadixIndex`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of Node4 instances
    pub node4_count: usize,
    /// Number of Node16 instances
    pub node16_count: usize,
    /// Number of Node48 instances
    pub node48_count: usize,
    /// Number of Node256 instances
    pub node256_count: usize,
    /// Nodes where a word ends
    pub final_words: usize,
    /// Sum of posting list lengths
    pub postings: usize,
}

impl IndexStats {
    /// Total number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.node4_count + self.node16_count + self.node48_count + self.node256_count
    }
}

enum Step {
    Descend { parent: NodeRef, child: NodeRef },
    Restart,
}

/// Inverted index from word bytes to the ids of documents containing them.
pub struct RadixIndex {
    root: RwLock<NodeRef>,
}

impl RadixIndex {
    /// Create an empty index (a lone Node4 root).
    pub fn new() -> Self {
        Self::from_root(NodeCell::new(Node::new_node4()))
    }

    pub(crate) fn from_root(root: NodeRef) -> Self {
        Self {
            root: RwLock::new(root),
        }
    }

    /// Current root node.
    pub fn root(&self) -> NodeRef {
        self.root.read().clone()
    }

    /// Record that `doc_id` contains `word`.
    ///
    /// Missing edges are created as Node4 children; a full node is upgraded
    /// to the next width. Inserting the same pair twice keeps one entry.
    pub fn insert(&self, word: impl AsRef<[u8]>, doc_id: DocId) -> Result<(), IndexError> {
        let word = word.as_ref();
        if word.is_empty() {
            return Err(IndexError::InvalidArgument("word must not be empty"));
        }

        'walk: loop {
            let mut parent: Option<(NodeRef, u8)> = None;
            let mut current = self.root();
            for &key in word {
                let slot = parent.as_ref().map(|(p, k)| (p, *k));
                match self.step(slot, &current, key)? {
                    Step::Restart => continue 'walk,
                    Step::Descend { parent: p, child } => {
                        parent = Some((p, key));
                        current = child;
                    }
                }
            }

            let mut node = current.write();
            if current.is_retired() {
                continue 'walk;
            }
            node.postings_mut().insert(doc_id);
            return Ok(());
        }
    }

    /// Follow (or create) the edge `key` below `current`.
    ///
    /// `parent` is the node holding `current` and the byte it hangs under,
    /// `None` when `current` is the root.
    fn step(
        &self,
        parent: Option<(&NodeRef, u8)>,
        current: &NodeRef,
        key: u8,
    ) -> Result<Step, IndexError> {
        {
            let node = current.read();
            if current.is_retired() {
                return Ok(Step::Restart);
            }
            if let Some(child) = node.find_child(key) {
                return Ok(Step::Descend {
                    parent: current.clone(),
                    child: child.clone(),
                });
            }
        }

        match current.insert_key(key)? {
            KeyInsert::Existing(child) | KeyInsert::Created(child) => Ok(Step::Descend {
                parent: current.clone(),
                child,
            }),
            KeyInsert::Retired => Ok(Step::Restart),
            KeyInsert::Upgraded {
                child,
                replacement,
                held,
            } => {
                let swapped = match parent {
                    Some((p, parent_key)) => p.swap_child(parent_key, current, replacement.clone()),
                    None => self.swap_root(current, replacement.clone()),
                };
                if !swapped {
                    return Ok(Step::Restart);
                }
                current.retire_held(&held);
                trace!(from = ?held.node_type(), to = ?held.node_type().next(), "node upgraded");
                drop(held);
                Ok(Step::Descend {
                    parent: replacement,
                    child,
                })
            }
        }
    }

    fn swap_root(&self, expected: &NodeRef, replacement: NodeRef) -> bool {
        let mut root = self.root.write();
        if Arc::ptr_eq(&root, expected) {
            *root = replacement;
            true
        } else {
            false
        }
    }

    /// Node reached by following `word` byte by byte, if every edge exists.
    fn locate(&self, word: &[u8]) -> Option<NodeRef> {
        'walk: loop {
            let mut current = self.root();
            for &key in word {
                let next = {
                    let node = current.read();
                    if current.is_retired() {
                        continue 'walk;
                    }
                    node.find_child(key).cloned()
                };
                current = next?;
            }
            return Some(current);
        }
    }

    /// Ids of the documents containing `word`, ascending.
    ///
    /// `None` when the word was never inserted (missing edge or a node that
    /// only exists as a prefix of longer words).
    pub fn find(&self, word: impl AsRef<[u8]>) -> Option<Vec<DocId>> {
        let word = word.as_ref();
        loop {
            let found = self.locate(word)?;
            let node = found.read();
            if found.is_retired() {
                continue;
            }
            let postings = node.postings();
            return postings
                .is_final_word()
                .then(|| postings.link_indices().to_vec());
        }
    }

    /// The node reached by `word`, whether or not a word ends there.
    pub fn find_node(&self, word: impl AsRef<[u8]>) -> Option<NodeRef> {
        self.locate(word.as_ref())
    }

    /// Reset to an empty tree.
    pub fn clear(&self) {
        *self.root.write() = NodeCell::new(Node::new_node4());
    }

    /// Count nodes per type and postings.
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        let mut stack = vec![self.root()];
        while let Some(cell) = stack.pop() {
            let node = cell.read();
            match node.node_type() {
                NodeType::Node4 => stats.node4_count += 1,
                NodeType::Node16 => stats.node16_count += 1,
                NodeType::Node48 => stats.node48_count += 1,
                NodeType::Node256 => stats.node256_count += 1,
            }
            if node.postings().is_final_word() {
                stats.final_words += 1;
            }
            stats.postings += node.postings().link_indices().len();
            stack.extend(node.entries().into_iter().map(|(_, child)| child));
        }
        stats
    }

    /// Every stored word with its posting list, in byte order.
    pub fn words(&self) -> Vec<(Vec<u8>, Vec<DocId>)> {
        let mut out = Vec::new();
        let mut path: Vec<u8> = Vec::new();
        let mut stack: Vec<(NodeRef, Option<u8>, usize)> = vec![(self.root(), None, 0)];
        while let Some((cell, key, depth)) = stack.pop() {
            path.truncate(depth.saturating_sub(1));
            path.extend(key);
            let node = cell.read();
            let postings = node.postings();
            if postings.is_final_word() {
                out.push((path.clone(), postings.link_indices().to_vec()));
            }
            for (key, child) in node.entries() {
                stack.push((child, Some(key), depth + 1));
            }
        }
        out.sort();
        out
    }
}

impl Default for RadixIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RadixIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadixIndex")
            .field("stats", &self.stats())
            .finish()
    }
}
