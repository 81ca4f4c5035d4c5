//! Binary snapshot format of a [`RadixIndex`].
//!
//! Nodes are written depth-first in pre-order, children in each node's
//! internal child order. Every node is:
//!
//! ```text
//! node_type       u32   0 = Node4, 1 = Node16, 2 = Node48, 3 = Node256
//! children_count  u32
//! is_final_word   u8
//! indices_count   u32
//! link_indices    u64 * indices_count
//! keys            Node4/16/256: one byte per child, in child order
//!                 Node48: (key, slot) byte pairs, ascending key order
//! ```
//!
//! All integers are little-endian. Files and in-memory buffers go through the
//! same writer, so both produce identical bytes for the same tree.
//!
//! Both directions walk the tree with an explicit stack, so word length is
//! bounded by memory only, never by the thread's stack.

mod progress;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::art::{DocId, Node, NodeCell, NodeRef, NodeType, Postings, RadixIndex};
use crate::encoding::{write_u32, write_u64, write_u8, ByteReader};
use crate::error::{PersistenceError, PersistenceResult};

use progress::Progress;

/// What an export produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    /// Nodes written.
    pub nodes: usize,
    /// Bytes written.
    pub bytes: u64,
}

/// One node's header, keys and children, copied out under its read lock.
struct NodeImage {
    node_type: NodeType,
    postings: Postings,
    key_bytes: Vec<u8>,
    children: Vec<NodeRef>,
}

impl NodeImage {
    fn capture(cell: &NodeRef) -> Self {
        let node = cell.read();
        let node_type = node.node_type();
        let entries = node.entries();
        let key_bytes = match node_type {
            NodeType::Node48 => node
                .slot_pairs()
                .into_iter()
                .flat_map(|(key, slot)| [key, slot])
                .collect(),
            _ => entries.iter().map(|(key, _)| *key).collect(),
        };
        Self {
            node_type,
            postings: node.postings().clone(),
            key_bytes,
            children: entries.into_iter().map(|(_, child)| child).collect(),
        }
    }

    fn write_to<W: Write>(&self, out: &mut W) -> PersistenceResult<u64> {
        let ids = self.postings.link_indices();
        write_u32(out, self.node_type.tag())?;
        write_u32(out, self.children.len() as u32)?;
        write_u8(out, self.postings.is_final_word() as u8)?;
        write_u32(out, ids.len() as u32)?;
        for &id in ids {
            write_u64(out, id)?;
        }
        out.write_all(&self.key_bytes)?;
        Ok(13 + 8 * ids.len() as u64 + self.key_bytes.len() as u64)
    }
}

/// Serialize `index` into `out`.
///
/// Each node is snapshotted under its own read lock, so concurrent inserts
/// may or may not be reflected, but every written node is self-consistent.
pub fn export<W: Write>(index: &RadixIndex, mut out: W) -> PersistenceResult<ExportSummary> {
    let mut progress = Progress::new("export", index.stats().node_count() as u64);
    let mut summary = ExportSummary { nodes: 0, bytes: 0 };

    // Each frame is a written node and the index of its next unwritten child.
    let mut stack: Vec<(NodeImage, usize)> = Vec::new();
    let mut pending = Some(index.root());
    loop {
        if let Some(cell) = pending.take() {
            let image = NodeImage::capture(&cell);
            summary.bytes += image.write_to(&mut out)?;
            summary.nodes += 1;
            progress.advance(1);
            stack.push((image, 0));
        }
        let Some((image, next)) = stack.last_mut() else {
            break;
        };
        pending = image.children.get(*next).cloned();
        *next += 1;
        if pending.is_none() {
            stack.pop();
        }
    }

    out.flush()?;
    debug!(nodes = summary.nodes, bytes = summary.bytes, "index exported");
    Ok(summary)
}

/// Serialize `index` into a fresh buffer (peer transfer).
pub fn export_to_vec(index: &RadixIndex) -> PersistenceResult<Vec<u8>> {
    let mut buf = Vec::new();
    export(index, &mut buf)?;
    Ok(buf)
}

/// Serialize `index` into `path`.
///
/// The bytes go to a uniquely named temp file in the same directory that is
/// synced and then renamed over `path`, so readers only ever see a complete
/// snapshot and concurrent writers never share a temp file.
pub fn export_to_file(index: &RadixIndex, path: &Path) -> PersistenceResult<ExportSummary> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    let mut writer = BufWriter::new(tmp.as_file_mut());
    let summary = export(index, &mut writer)?;
    writer.into_inner().map_err(|e| e.into_error())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    info!(path = %path.display(), nodes = summary.nodes, bytes = summary.bytes, "index written");
    Ok(summary)
}

/// Directory holding `path`, `.` for a bare file name.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Rebuild an index from an in-memory buffer (peer transfer).
pub fn import_from_slice(bytes: &[u8]) -> PersistenceResult<RadixIndex> {
    let mut reader = ByteReader::new(bytes);
    let mut progress = Progress::new("import", bytes.len() as u64);
    let root = import_tree(&mut reader, &mut progress)?;
    if !reader.is_empty() {
        return Err(PersistenceError::Corrupt {
            offset: reader.position(),
            reason: format!("{} trailing bytes after root subtree", reader.remaining()),
        });
    }
    debug!(bytes = bytes.len(), percent = progress.percent(), "index imported");
    Ok(RadixIndex::from_root(root))
}

/// Rebuild an index from a checkpoint file.
pub fn import_from_file(path: &Path) -> PersistenceResult<RadixIndex> {
    let file = File::open(path)?;
    // SAFETY: checkpoint files are only ever replaced by rename, never
    // written in place, so the mapping cannot change underneath us.
    let map = unsafe { Mmap::map(&file)? };
    let index = import_from_slice(&map)?;
    info!(path = %path.display(), bytes = map.len(), "index loaded");
    Ok(index)
}

fn corrupt(offset: usize, reason: impl Into<String>) -> PersistenceError {
    PersistenceError::Corrupt {
        offset,
        reason: reason.into(),
    }
}

/// A decoded node whose children are still being read.
struct PendingNode {
    node: Node,
    keys: Vec<u8>,
    next: usize,
}

/// Decode a whole subtree in pre-order.
///
/// Children are linked into their parent with `add_child` in the order they
/// are encountered, so a Node48 gets back the slot layout it was written with.
fn import_tree(reader: &mut ByteReader<'_>, progress: &mut Progress) -> PersistenceResult<NodeRef> {
    let mut ancestors: Vec<PendingNode> = Vec::new();
    let mut current = read_node(reader)?;
    loop {
        if current.next < current.keys.len() {
            let child = read_node(reader)?;
            ancestors.push(std::mem::replace(&mut current, child));
            continue;
        }

        progress.set(reader.position() as u64);
        let cell = NodeCell::new(current.node);
        match ancestors.pop() {
            None => return Ok(cell),
            Some(mut parent) => {
                parent.node.add_child(parent.keys[parent.next], cell)?;
                parent.next += 1;
                current = parent;
            }
        }
    }
}

/// Read one node's header, postings and keys. Its children follow.
fn read_node(reader: &mut ByteReader<'_>) -> PersistenceResult<PendingNode> {
    let offset = reader.position();
    let tag = reader.read_u32()?;
    let node_type = NodeType::from_tag(tag).ok_or(PersistenceError::UnknownNodeType {
        node_type: tag,
        offset,
    })?;
    let count = reader.read_u32()? as usize;
    if count > node_type.capacity() {
        return Err(corrupt(
            offset,
            format!("{:?} claims {} children", node_type, count),
        ));
    }
    let is_final_word = match reader.read_u8()? {
        0 => false,
        1 => true,
        other => return Err(corrupt(offset, format!("final flag {}", other))),
    };

    let indices_count = reader.read_u32()? as usize;
    if indices_count.saturating_mul(8) > reader.remaining() {
        return Err(PersistenceError::Truncated {
            offset: reader.position(),
            needed: indices_count.saturating_mul(8),
        });
    }
    let ids = (0..indices_count)
        .map(|_| reader.read_u64())
        .collect::<PersistenceResult<Vec<DocId>>>()?;
    if !is_final_word && !ids.is_empty() {
        return Err(corrupt(offset, "postings on a non-final node"));
    }

    let keys = match node_type {
        NodeType::Node48 => read_slot_pairs(reader, count)?,
        _ => {
            let keys = reader.read_bytes(count)?.to_vec();
            if let Some(dup) = first_duplicate(&keys) {
                return Err(corrupt(offset, format!("duplicate key {}", dup)));
            }
            keys
        }
    };

    let mut node = Node::with_type(node_type);
    *node.postings_mut() = Postings::from_parts(is_final_word, ids);
    Ok(PendingNode {
        node,
        keys,
        next: 0,
    })
}

/// Read a Node48's (key, slot) pairs and return its keys in slot order.
///
/// Every slot in `0..count` must be claimed by exactly one key, and keys must
/// be strictly ascending.
fn read_slot_pairs(reader: &mut ByteReader<'_>, count: usize) -> PersistenceResult<Vec<u8>> {
    let offset = reader.position();
    let mut slot_keys: Vec<Option<u8>> = vec![None; count];
    let mut prev_key: Option<u8> = None;
    for _ in 0..count {
        let key = reader.read_u8()?;
        let slot = reader.read_u8()?;
        if prev_key.is_some_and(|prev| key <= prev) {
            return Err(corrupt(offset, format!("Node48 key {} out of order", key)));
        }
        match slot_keys.get_mut(slot as usize) {
            None => {
                return Err(corrupt(
                    offset,
                    format!("Node48 slot {} out of range for {} children", slot, count),
                ))
            }
            Some(Some(other)) => {
                return Err(corrupt(
                    offset,
                    format!("Node48 slot {} claimed by keys {} and {}", slot, other, key),
                ))
            }
            Some(entry) => *entry = Some(key),
        }
        prev_key = Some(key);
    }
    Ok(slot_keys.into_iter().flatten().collect())
}

fn first_duplicate(keys: &[u8]) -> Option<u8> {
    let mut seen = [false; 256];
    for &k in keys {
        if std::mem::replace(&mut seen[k as usize], true) {
            return Some(k);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;

    fn sample_index() -> RadixIndex {
        let index = RadixIndex::new();
        for (i, word) in ["hello", "help", "world", "word", "a"].iter().enumerate() {
            index.insert(word, i as DocId).unwrap();
            index.insert(word, 100 + i as DocId).unwrap();
        }
        // Widen the root through every node type.
        for b in 0..=200u8 {
            index.insert([b'#', b], b as DocId).unwrap();
        }
        for b in 0..30u8 {
            index.insert([b'%', b], b as DocId).unwrap();
        }
        index
    }

    #[test]
    fn test_empty_tree_layout() {
        let bytes = export_to_vec(&RadixIndex::new()).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let index = import_from_slice(&bytes).unwrap();
        assert_eq!(index.stats().node_count(), 1);
    }

    #[test]
    fn test_single_word_layout() {
        let index = RadixIndex::new();
        index.insert("a", 7).unwrap();
        let bytes = export_to_vec(&index).unwrap();
        let mut expected = vec![0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, b'a'];
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 0, 0]);
        expected.extend_from_slice(&7u64.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_round_trip_preserves_finds_and_shape() {
        let index = sample_index();
        let bytes = export_to_vec(&index).unwrap();
        let copy = import_from_slice(&bytes).unwrap();

        assert_eq!(copy.words(), index.words());
        assert_eq!(copy.stats(), index.stats());
        assert!(copy.verify_integrity().is_empty());
        assert_eq!(copy.find_node("#").unwrap().read().node_type(), NodeType::Node256);
        assert_eq!(copy.find_node("%").unwrap().read().node_type(), NodeType::Node48);
        // Re-exporting the copy is bit-identical.
        assert_eq!(export_to_vec(&copy).unwrap(), bytes);
    }

    #[test]
    fn test_file_and_buffer_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.art");
        let index = sample_index();

        let summary = export_to_file(&index, &path).unwrap();
        let from_file = fs::read(&path).unwrap();
        assert_eq!(from_file, export_to_vec(&index).unwrap());
        assert_eq!(summary.bytes, from_file.len() as u64);
        assert_eq!(summary.nodes, index.stats().node_count());
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec!["index.art"]);

        let loaded = import_from_file(&path).unwrap();
        assert_eq!(loaded.words(), index.words());
    }

    #[test]
    fn test_node48_slot_order_survives() {
        let index = RadixIndex::new();
        // Insertion order differs from key order.
        for b in (0..20u8).rev() {
            index.insert([b'x', b * 3], b as DocId).unwrap();
        }
        let bytes = export_to_vec(&index).unwrap();
        let copy = import_from_slice(&bytes).unwrap();
        let original = index.find_node("x").unwrap().read().slot_pairs();
        let restored = copy.find_node("x").unwrap().read().slot_pairs();
        assert_eq!(original, restored);
    }

    fn node48_with_pairs(pairs: &[(u8, u8)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 2).unwrap();
        write_u32(&mut bytes, pairs.len() as u32).unwrap();
        write_u8(&mut bytes, 0).unwrap();
        write_u32(&mut bytes, 0).unwrap();
        for &(k, s) in pairs {
            bytes.extend_from_slice(&[k, s]);
        }
        for _ in pairs {
            bytes.extend_from_slice(&[0; 13]);
        }
        bytes
    }

    #[test]
    fn test_node48_duplicate_slot_rejected() {
        let bytes = node48_with_pairs(&[(1, 0), (2, 0)]);
        match import_from_slice(&bytes) {
            Err(PersistenceError::Corrupt { reason, .. }) => assert!(reason.contains("claimed")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let bytes = node48_with_pairs(&[(1, 0), (2, 5)]);
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::Corrupt { .. })
        ));

        let bytes = node48_with_pairs(&[(1, 1), (2, 0)]);
        let index = import_from_slice(&bytes).unwrap();
        assert_eq!(index.root().read().slot_pairs(), vec![(1, 1), (2, 0)]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            import_from_slice(&[]),
            Err(PersistenceError::Truncated { offset: 0, .. })
        ));

        let mut bytes = export_to_vec(&RadixIndex::new()).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::UnknownNodeType { node_type: 9, offset: 0 })
        ));

        let mut bytes = export_to_vec(&sample_index()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::Truncated { .. })
        ));

        let mut bytes = export_to_vec(&RadixIndex::new()).unwrap();
        bytes.push(0);
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_keys_and_huge_counts() {
        // Node4 claiming two children under the same key.
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0).unwrap();
        write_u32(&mut bytes, 2).unwrap();
        write_u8(&mut bytes, 0).unwrap();
        write_u32(&mut bytes, 0).unwrap();
        bytes.extend_from_slice(&[b'a', b'a']);
        bytes.extend_from_slice(&[0; 26]);
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::Corrupt { .. })
        ));

        // Node4 claiming five children.
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0).unwrap();
        write_u32(&mut bytes, 5).unwrap();
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::Corrupt { .. })
        ));

        // Posting count larger than the buffer.
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0).unwrap();
        write_u32(&mut bytes, 0).unwrap();
        write_u8(&mut bytes, 1).unwrap();
        write_u32(&mut bytes, u32::MAX).unwrap();
        assert!(matches!(
            import_from_slice(&bytes),
            Err(PersistenceError::Truncated { .. })
        ));
    }

    #[test]
    fn test_long_words_round_trip_on_default_stack() {
        let handle = thread::spawn(|| {
            let index = RadixIndex::new();
            let long = vec![b'a'; 10_000];
            index.insert(&long, 1).unwrap();
            let mut sibling = long.clone();
            sibling[9_000] = b'b';
            index.insert(&sibling, 2).unwrap();
            // A Node256 halfway down.
            for b in 0..=255u8 {
                let mut word = long[..5_000].to_vec();
                word.push(b);
                index.insert(&word, 10 + b as DocId).unwrap();
            }

            let bytes = export_to_vec(&index).unwrap();
            let copy = import_from_slice(&bytes).unwrap();
            assert_eq!(copy.find(&long), Some(vec![1]));
            assert_eq!(copy.find(&sibling), Some(vec![2]));
            assert_eq!(copy.find(&long[..5_001]), Some(vec![10 + b'a' as DocId]));
            assert_eq!(copy.find(&long[..9_999]), None);
            assert_eq!(
                copy.find_node(&long[..5_000]).unwrap().read().node_type(),
                NodeType::Node256
            );
            assert_eq!(copy.stats(), index.stats());
            assert!(copy.verify_integrity().is_empty());
            assert_eq!(export_to_vec(&copy).unwrap(), bytes);
        });
        handle.join().unwrap();
    }

    #[test]
    fn test_long_word_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.art");
        let handle = thread::spawn(move || {
            let index = RadixIndex::new();
            let word: Vec<u8> = (0..20_000u32).map(|i| b'a' + (i % 26) as u8).collect();
            index.insert(&word, 42).unwrap();
            export_to_file(&index, &path).unwrap();
            let loaded = import_from_file(&path).unwrap();
            assert_eq!(loaded.find(&word), Some(vec![42]));
            assert_eq!(loaded.stats().node_count(), 20_001);
        });
        handle.join().unwrap();
    }
}
