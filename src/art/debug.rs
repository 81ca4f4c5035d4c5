//! Debug utilities for index troubleshooting.

use std::fmt::Write;

use super::{NodeRef, NodeType, RadixIndex};

impl RadixIndex {
    /// Render the tree structure, one node per line.
    pub fn debug_dump(&self) -> String {
        let mut out = String::from("=== RadixIndex ===\n");
        let mut stack: Vec<(NodeRef, Option<u8>, usize)> = vec![(self.root(), None, 0)];
        while let Some((cell, key, depth)) = stack.pop() {
            let node = cell.read();
            let label = match key {
                Some(k) if k.is_ascii_graphic() => format!("[{}] ", k as char),
                Some(k) => format!("[{:#04x}] ", k),
                None => String::new(),
            };
            let _ = writeln!(
                out,
                "{}{}{:?} (children={}{})",
                "  ".repeat(depth),
                label,
                node.node_type(),
                node.num_children(),
                if node.postings().is_final_word() {
                    format!(", docs={:?}", node.postings().link_indices())
                } else {
                    String::new()
                }
            );
            let entries = node.entries();
            drop(node);
            for (k, child) in entries.into_iter().rev() {
                stack.push((child, Some(k), depth + 1));
            }
        }
        out
    }

    /// Verify tree integrity - returns list of issues found.
    pub fn verify_integrity(&self) -> Vec<String> {
        let mut issues = Vec::new();
        // Pre-order walk; `path` holds the bytes from the root to the current node.
        let mut path: Vec<u8> = Vec::new();
        let mut stack: Vec<(NodeRef, Option<u8>, usize)> = vec![(self.root(), None, 0)];
        while let Some((cell, key, depth)) = stack.pop() {
            path.truncate(depth.saturating_sub(1));
            path.extend(key);
            let entries = Self::verify_node(&cell, &mut issues, &path);
            for (k, child) in entries.into_iter().rev() {
                stack.push((child, Some(k), depth + 1));
            }
        }
        issues
    }

    /// Check one node and return its children.
    fn verify_node(cell: &NodeRef, issues: &mut Vec<String>, path: &[u8]) -> Vec<(u8, NodeRef)> {
        let node = cell.read();
        let node_type = node.node_type();
        let n = node.num_children();

        if cell.is_retired() {
            issues.push(format!("retired node reachable at path {:?}", path));
        }
        if n > node_type.capacity() {
            issues.push(format!(
                "{:?} has {} children (max {})",
                node_type,
                n,
                node_type.capacity()
            ));
        }

        let postings = node.postings();
        if !postings.is_final_word() && !postings.link_indices().is_empty() {
            issues.push(format!("non-final node at path {:?} carries postings", path));
        }
        if postings.link_indices().windows(2).any(|w| w[0] >= w[1]) {
            issues.push(format!("postings at path {:?} are not sorted and unique", path));
        }

        if node_type == NodeType::Node48 {
            let pairs = node.slot_pairs();
            if pairs.len() != n {
                issues.push(format!(
                    "Node48 has {} valid indices but {} children",
                    pairs.len(),
                    n
                ));
            }
            let mut seen = [false; 48];
            for (byte, slot) in pairs {
                let ix = slot as usize;
                if ix >= n.min(seen.len()) || seen[ix] {
                    issues.push(format!("Node48 byte {} maps to bad slot {}", byte, slot));
                } else {
                    seen[ix] = true;
                }
            }
        }

        let entries = node.entries();
        for (i, (key, _)) in entries.iter().enumerate() {
            if entries[..i].iter().any(|(k, _)| k == key) {
                issues.push(format!("{:?} has duplicate key {}", node_type, key));
            }
        }
        entries
    }
}
