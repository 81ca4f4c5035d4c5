//! ART node types with adaptive sizing.
//!
//! A node picks its layout from the number of children it holds:
//!
//! - Node4: up to 4 children, keys scanned linearly
//! - Node16: up to 16 children, keys scanned linearly
//! - Node48: 256-byte index into 48 child slots
//! - Node256: direct array indexing
//!
//! Every node lives in a [`NodeCell`] that owns its lock. Growing a node
//! never mutates it in place: a wider copy is built and the parent slot is
//! pointed at it, while the old cell is marked retired.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::error::IndexError;

/// Identifier of a crawled document.
pub type DocId = u64;

/// Shared handle to a node.
pub type NodeRef = Arc<NodeCell>;

/// Marks an unused byte in a Node48 index.
pub(crate) const EMPTY_SLOT: u8 = 255;

/// The type of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// A node with up to 4 children.
    Node4,
    /// A node with up to 16 children.
    Node16,
    /// A node with up to 48 children.
    Node48,
    /// A node with up to 256 children.
    Node256,
}

impl NodeType {
    /// Maximum number of children.
    pub fn capacity(self) -> usize {
        match self {
            NodeType::Node4 => 4,
            NodeType::Node16 => 16,
            NodeType::Node48 => 48,
            NodeType::Node256 => 256,
        }
    }

    /// Tag written to the persisted format.
    pub fn tag(self) -> u32 {
        match self {
            NodeType::Node4 => 0,
            NodeType::Node16 => 1,
            NodeType::Node48 => 2,
            NodeType::Node256 => 3,
        }
    }

    /// Inverse of [`NodeType::tag`].
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(NodeType::Node4),
            1 => Some(NodeType::Node16),
            2 => Some(NodeType::Node48),
            3 => Some(NodeType::Node256),
            _ => None,
        }
    }

    /// The width a full node of this type grows into.
    pub fn next(self) -> Option<Self> {
        match self {
            NodeType::Node4 => Some(NodeType::Node16),
            NodeType::Node16 => Some(NodeType::Node48),
            NodeType::Node48 => Some(NodeType::Node256),
            NodeType::Node256 => None,
        }
    }
}

/// Terminal state of a node: whether a word ends here and which documents contain it.
///
/// Ids are kept sorted and unique, so membership is a binary search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Postings {
    is_final_word: bool,
    link_indices: SmallVec<[DocId; 4]>,
}

impl Postings {
    /// Build postings from persisted parts. Ids are sorted and deduplicated.
    pub fn from_parts(is_final_word: bool, ids: impl IntoIterator<Item = DocId>) -> Self {
        let mut link_indices: SmallVec<[DocId; 4]> = ids.into_iter().collect();
        link_indices.sort_unstable();
        link_indices.dedup();
        Self {
            is_final_word,
            link_indices,
        }
    }

    /// Whether some inserted word ends at this node.
    pub fn is_final_word(&self) -> bool {
        self.is_final_word
    }

    /// Documents containing the word ending here, ascending.
    pub fn link_indices(&self) -> &[DocId] {
        &self.link_indices
    }

    /// Mark the node final and record `doc_id`. Returns false if it was already present.
    pub fn insert(&mut self, doc_id: DocId) -> bool {
        self.is_final_word = true;
        match self.link_indices.binary_search(&doc_id) {
            Ok(_) => false,
            Err(pos) => {
                self.link_indices.insert(pos, doc_id);
                true
            }
        }
    }
}

/// A node in the radix index.
pub enum Node {
    /// A node with up to 4 children.
    Node4 {
        /// Child keys, in insertion order.
        keys: [u8; 4],
        /// Child nodes, parallel to `keys`.
        children: SmallVec<[NodeRef; 4]>,
        /// Terminal state.
        postings: Postings,
    },

    /// A node with up to 16 children.
    Node16 {
        /// Child keys, in insertion order.
        keys: [u8; 16],
        /// Child nodes, parallel to `keys`.
        children: Vec<NodeRef>,
        /// Terminal state.
        postings: Postings,
    },

    /// A node with up to 48 children.
    Node48 {
        /// Slot of each byte's child ([`EMPTY_SLOT`] = none). Boxed to reduce enum size.
        child_index: Box<[u8; 256]>,
        /// Child nodes in slot (insertion) order.
        children: Vec<NodeRef>,
        /// Terminal state.
        postings: Postings,
    },

    /// A node with up to 256 children.
    Node256 {
        /// Number of occupied entries.
        num_children: u16,
        /// Child nodes (direct indexing by byte). Boxed to reduce enum size.
        children: Box<[Option<NodeRef>; 256]>,
        /// Terminal state.
        postings: Postings,
    },
}

impl Node {
    /// Create a new Node4.
    pub fn new_node4() -> Self {
        Node::Node4 {
            keys: [0; 4],
            children: SmallVec::new(),
            postings: Postings::default(),
        }
    }

    /// Create a new Node16.
    pub fn new_node16() -> Self {
        Node::Node16 {
            keys: [0; 16],
            children: Vec::with_capacity(16),
            postings: Postings::default(),
        }
    }

    /// Create a new Node48.
    pub fn new_node48() -> Self {
        Node::Node48 {
            child_index: Box::new([EMPTY_SLOT; 256]),
            children: Vec::with_capacity(48),
            postings: Postings::default(),
        }
    }

    /// Create a new Node256.
    pub fn new_node256() -> Self {
        Node::Node256 {
            num_children: 0,
            children: Box::new(std::array::from_fn(|_| None)),
            postings: Postings::default(),
        }
    }

    /// Create an empty node of the given type.
    pub fn with_type(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Node4 => Self::new_node4(),
            NodeType::Node16 => Self::new_node16(),
            NodeType::Node48 => Self::new_node48(),
            NodeType::Node256 => Self::new_node256(),
        }
    }

    /// Get the node type.
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Node4 { .. } => NodeType::Node4,
            Node::Node16 { .. } => NodeType::Node16,
            Node::Node48 { .. } => NodeType::Node48,
            Node::Node256 { .. } => NodeType::Node256,
        }
    }

    /// Get the number of children.
    pub fn num_children(&self) -> usize {
        match self {
            Node::Node4 { children, .. } => children.len(),
            Node::Node16 { children, .. } | Node::Node48 { children, .. } => children.len(),
            Node::Node256 { num_children, .. } => *num_children as usize,
        }
    }

    /// True when adding a new key requires growing the node.
    pub fn is_full(&self) -> bool {
        self.num_children() >= self.node_type().capacity()
    }

    /// Terminal state of this node.
    pub fn postings(&self) -> &Postings {
        match self {
            Node::Node4 { postings, .. }
            | Node::Node16 { postings, .. }
            | Node::Node48 { postings, .. }
            | Node::Node256 { postings, .. } => postings,
        }
    }

    /// Mutable terminal state of this node.
    pub fn postings_mut(&mut self) -> &mut Postings {
        match self {
            Node::Node4 { postings, .. }
            | Node::Node16 { postings, .. }
            | Node::Node48 { postings, .. }
            | Node::Node256 { postings, .. } => postings,
        }
    }

    /// Find the child for a key byte.
    pub fn find_child(&self, key: u8) -> Option<&NodeRef> {
        match self {
            Node::Node4 { keys, children, .. } => {
                let n = children.len();
                keys[..n].iter().position(|&k| k == key).map(|i| &children[i])
            }
            Node::Node16 { keys, children, .. } => {
                let n = children.len();
                keys[..n].iter().position(|&k| k == key).map(|i| &children[i])
            }
            Node::Node48 {
                child_index,
                children,
                ..
            } => {
                let slot = child_index[key as usize];
                if slot == EMPTY_SLOT {
                    None
                } else {
                    children.get(slot as usize)
                }
            }
            Node::Node256 { children, .. } => children[key as usize].as_ref(),
        }
    }

    /// Link `child` under `key`, replacing an existing child for the same key.
    ///
    /// Fails when the key is new and the node is already at capacity.
    pub fn add_child(&mut self, key: u8, child: NodeRef) -> Result<(), IndexError> {
        let full = self.is_full();
        let node_type = self.node_type();
        match self {
            Node::Node4 { keys, children, .. } => {
                let n = children.len();
                if let Some(i) = keys[..n].iter().position(|&k| k == key) {
                    children[i] = child;
                    return Ok(());
                }
                if full {
                    return Err(full_error(node_type, key));
                }
                keys[n] = key;
                children.push(child);
            }
            Node::Node16 { keys, children, .. } => {
                let n = children.len();
                if let Some(i) = keys[..n].iter().position(|&k| k == key) {
                    children[i] = child;
                    return Ok(());
                }
                if full {
                    return Err(full_error(node_type, key));
                }
                keys[n] = key;
                children.push(child);
            }
            Node::Node48 {
                child_index,
                children,
                ..
            } => {
                let slot = child_index[key as usize];
                if slot != EMPTY_SLOT {
                    children[slot as usize] = child;
                    return Ok(());
                }
                if full {
                    return Err(full_error(node_type, key));
                }
                child_index[key as usize] = children.len() as u8;
                children.push(child);
            }
            Node::Node256 {
                num_children,
                children,
                ..
            } => {
                let entry = &mut children[key as usize];
                if entry.is_none() {
                    *num_children += 1;
                }
                *entry = Some(child);
            }
        }
        Ok(())
    }

    /// All (key, child) pairs in the node's internal child order.
    ///
    /// Node4/16 keep insertion order, Node48 slot order, Node256 byte order.
    pub fn entries(&self) -> Vec<(u8, NodeRef)> {
        match self {
            Node::Node4 { keys, children, .. } => keys
                .iter()
                .zip(children.iter())
                .map(|(&k, c)| (k, c.clone()))
                .collect(),
            Node::Node16 { keys, children, .. } => keys
                .iter()
                .zip(children.iter())
                .map(|(&k, c)| (k, c.clone()))
                .collect(),
            Node::Node48 {
                child_index,
                children,
                ..
            } => {
                let mut slot_keys = vec![0u8; children.len()];
                for (byte, &slot) in child_index.iter().enumerate() {
                    if let Some(k) = slot_keys.get_mut(slot as usize) {
                        *k = byte as u8;
                    }
                }
                slot_keys
                    .into_iter()
                    .zip(children.iter())
                    .map(|(k, c)| (k, c.clone()))
                    .collect()
            }
            Node::Node256 { children, .. } => children
                .iter()
                .enumerate()
                .filter_map(|(byte, c)| c.as_ref().map(|c| (byte as u8, c.clone())))
                .collect(),
        }
    }

    /// Occupied (key, slot) pairs of a Node48 in ascending key order.
    ///
    /// Empty for every other node type.
    pub fn slot_pairs(&self) -> Vec<(u8, u8)> {
        match self {
            Node::Node48 { child_index, .. } => child_index
                .iter()
                .enumerate()
                .filter(|(_, &slot)| slot != EMPTY_SLOT)
                .map(|(byte, &slot)| (byte as u8, slot))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Unlink every child, leaving an empty node of the same type.
    pub(crate) fn take_children(&mut self) -> Vec<NodeRef> {
        match self {
            Node::Node4 { children, .. } => std::mem::take(children).into_vec(),
            Node::Node16 { children, .. } => std::mem::take(children),
            Node::Node48 {
                child_index,
                children,
                ..
            } => {
                child_index.fill(EMPTY_SLOT);
                std::mem::take(children)
            }
            Node::Node256 {
                num_children,
                children,
                ..
            } => {
                *num_children = 0;
                children.iter_mut().filter_map(Option::take).collect()
            }
        }
    }

    /// Copy this node into the next wider layout.
    ///
    /// Every (key, child) pair, the postings and the final flag carry over.
    /// Returns `None` for a Node256.
    pub fn upgraded(&self) -> Option<Result<Node, IndexError>> {
        let next = self.node_type().next()?;
        let mut grown = Node::with_type(next);
        *grown.postings_mut() = self.postings().clone();
        for (key, child) in self.entries() {
            if let Err(e) = grown.add_child(key, child) {
                return Some(Err(e));
            }
        }
        Some(Ok(grown))
    }
}

fn full_error(node_type: NodeType, key: u8) -> IndexError {
    IndexError::InvariantViolation(format!(
        "{:?} is full, cannot add key {:#04x}",
        node_type, key
    ))
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<u8> = self.entries().into_iter().map(|(k, _)| k).collect();
        f.debug_struct(match self.node_type() {
            NodeType::Node4 => "Node4",
            NodeType::Node16 => "Node16",
            NodeType::Node48 => "Node48",
            NodeType::Node256 => "Node256",
        })
        .field("keys", &keys)
        .field("is_final_word", &self.postings().is_final_word())
        .field("link_indices", &self.postings().link_indices())
        .finish()
    }
}

/// Outcome of adding one edge below a locked node.
pub(crate) enum KeyInsert<'a> {
    /// The edge already existed, possibly added by a racing writer.
    Existing(NodeRef),
    /// A fresh child was linked into the node in place.
    Created(NodeRef),
    /// The node was full. `replacement` holds every old edge plus the new one,
    /// and `held` keeps the old node write-locked until the caller has pointed
    /// the parent slot at `replacement`.
    Upgraded {
        child: NodeRef,
        replacement: NodeRef,
        held: RwLockWriteGuard<'a, Node>,
    },
    /// A concurrent upgrade superseded this node; the walk must restart.
    Retired,
}

/// A node together with its lock and retirement flag.
pub struct NodeCell {
    node: RwLock<Node>,
    retired: AtomicBool,
}

impl NodeCell {
    /// Wrap a node in a new shared cell.
    pub fn new(node: Node) -> NodeRef {
        Arc::new(NodeCell {
            node: RwLock::new(node),
            retired: AtomicBool::new(false),
        })
    }

    /// Take the shared lock.
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.node.write()
    }

    /// Whether an upgrade replaced this node. Only meaningful while holding its lock.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Ensure an edge for `key` exists below this node.
    pub(crate) fn insert_key(&self, key: u8) -> Result<KeyInsert<'_>, IndexError> {
        let mut node = self.write();
        if self.is_retired() {
            return Ok(KeyInsert::Retired);
        }
        if let Some(child) = node.find_child(key) {
            return Ok(KeyInsert::Existing(child.clone()));
        }

        let child = NodeCell::new(Node::new_node4());
        if !node.is_full() {
            node.add_child(key, child.clone())?;
            return Ok(KeyInsert::Created(child));
        }

        let mut grown = node.upgraded().ok_or_else(|| {
            IndexError::InvariantViolation(format!("Node256 has no free slot for {:#04x}", key))
        })??;
        grown.add_child(key, child.clone())?;
        Ok(KeyInsert::Upgraded {
            child,
            replacement: NodeCell::new(grown),
            held: node,
        })
    }

    /// Point the slot for `key` at `replacement`, provided it still holds `expected`.
    ///
    /// Called while the caller holds `expected`'s write lock. Returns false when
    /// this node was itself retired or the slot moved on, in which case nothing
    /// changed.
    pub(crate) fn swap_child(&self, key: u8, expected: &NodeRef, replacement: NodeRef) -> bool {
        let mut node = self.write();
        if self.is_retired() {
            return false;
        }
        match node.find_child(key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                node.add_child(key, replacement).is_ok()
            }
            _ => false,
        }
    }

    /// Mark the node superseded. The caller must hold the guard returned by
    /// [`NodeCell::insert_key`].
    pub(crate) fn retire_held(&self, _held: &RwLockWriteGuard<'_, Node>) {
        self.retire();
    }
}

impl Drop for NodeCell {
    // Free uniquely owned descendants from a work list instead of letting
    // each `Arc` drop its children recursively, one frame per key byte.
    fn drop(&mut self) {
        let mut orphans = self.node.get_mut().take_children();
        while let Some(child) = orphans.pop() {
            if let Ok(mut cell) = Arc::try_unwrap(child) {
                orphans.append(&mut cell.node.get_mut().take_children());
            }
        }
    }
}

impl fmt::Debug for NodeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCell")
            .field("node", &*self.read())
            .field("retired", &self.is_retired())
            .finish()
    }
}
