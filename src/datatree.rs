//! DataTree - novelty tracking over explored byte buffers
//!
//! Every buffer the runner executes is recorded in a prefix tree over the byte alphabet. The tree
//! answers two questions cheaply, without running the test function:
//!
//! - could this buffer possibly reach behaviour we have not seen yet (`prescreen`), and
//! - if the next block we are about to hand to the test would only repeat known behaviour, what is
//!   the smallest change that escapes into unexplored territory (`rewrite_for_novelty`).
//!
//! Nodes live in an arena indexed by [`NodeId`]; node 0 is the root. A node is *dead* once the
//! subtree under it is fully explored: a leaf is dead as soon as it is created, and a branch
//! becomes dead when every admissible byte value at its position has a child and all of those
//! children are dead. Deadness only ever grows.
//!
//! Side tables remember facts learned about individual positions:
//! - `forced`: the only value the test ever accepts there (written rather than drawn),
//! - `capped`: the largest value the test accepts there,
//! - `block_sizes`: the length of the draw that starts there.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::data::{ConjectureResult, Status};

/// Index of a node in the tree arena
pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
enum Node {
    Branch(HashMap<u8, NodeId>),
    Leaf(Arc<ConjectureResult>),
}

/// Where an in-progress execution currently sits in the tree.
///
/// Kept by the byte source of one execution and advanced lazily from the bytes the execution has
/// actually committed, so that blocks altered after rewriting (zeroed, clamped, forced) never
/// desynchronise it.
#[derive(Debug, Clone, Default)]
pub struct NoveltyCursor {
    node: NodeId,
    evaluated_to: usize,
    hit_novelty: bool,
}

impl NoveltyCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once this execution has left the known part of the tree
    pub fn hit_novelty(&self) -> bool {
        self.hit_novelty
    }
}

#[derive(Debug, Clone)]
pub struct DataTree {
    nodes: Vec<Node>,
    dead: HashSet<NodeId>,
    forced: HashMap<NodeId, u8>,
    capped: HashMap<NodeId, u8>,
    block_sizes: HashMap<NodeId, usize>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    pub fn new() -> Self {
        DataTree {
            nodes: vec![Node::Branch(HashMap::new())],
            dead: HashSet::new(),
            forced: HashMap::new(),
            capped: HashMap::new(),
            block_sizes: HashMap::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    pub fn is_dead(&self, node: NodeId) -> bool {
        self.dead.contains(&node)
    }

    /// The whole input space has been explored
    pub fn is_exhausted(&self) -> bool {
        self.is_dead(ROOT)
    }

    /// Number of distinct byte values the test accepts at `node`
    fn capacity(&self, node: NodeId) -> usize {
        if self.forced.contains_key(&node) {
            1
        } else if let Some(&cap) = self.capped.get(&node) {
            cap as usize + 1
        } else {
            256
        }
    }

    /// The byte actually seen at `node` when the test is handed `byte`
    fn effective_byte(&self, node: NodeId, byte: u8) -> u8 {
        if let Some(&forced) = self.forced.get(&node) {
            return forced;
        }
        match self.capped.get(&node) {
            Some(&cap) => byte.min(cap),
            None => byte,
        }
    }

    fn child(&self, node: NodeId, byte: u8) -> Option<NodeId> {
        match &self.nodes[node] {
            Node::Branch(children) => children.get(&byte).copied(),
            Node::Leaf(_) => None,
        }
    }

    fn child_or_insert(&mut self, node: NodeId, byte: u8) -> NodeId {
        if let Some(child) = self.child(node, byte) {
            return child;
        }
        let child = self.nodes.len();
        self.nodes.push(Node::Branch(HashMap::new()));
        match &mut self.nodes[node] {
            Node::Branch(children) => {
                children.insert(byte, child);
            }
            Node::Leaf(_) => unreachable!("leaves are dead and never extended"),
        }
        child
    }

    /// Record a finished execution, returning the node its buffer reached.
    pub fn record(&mut self, result: &Arc<ConjectureResult>) -> NodeId {
        let block_lengths: HashMap<usize, usize> =
            result.blocks.iter().map(|&(u, v)| (u, v - u)).collect();

        let mut node = ROOT;
        let mut path = vec![ROOT];
        for (i, &byte) in result.buffer.iter().enumerate() {
            if self.is_dead(node) {
                break;
            }
            if let Some(&length) = block_lengths.get(&i) {
                self.block_sizes.entry(node).or_insert(length);
            }
            if result.forced_indices.contains(&i) {
                self.forced.entry(node).or_insert(byte);
            }
            if let Some(&cap) = result.capped.get(&i) {
                self.capped.entry(node).or_insert(cap);
            }
            node = self.child_or_insert(node, byte);
            path.push(node);
        }

        if result.status != Status::Overrun && !self.is_dead(node) {
            self.nodes[node] = Node::Leaf(Arc::clone(result));
            self.dead.insert(node);
            self.propagate_deadness(&path);
        }
        node
    }

    fn propagate_deadness(&mut self, path: &[NodeId]) {
        for &ancestor in path.iter().rev().skip(1) {
            let children = match &self.nodes[ancestor] {
                Node::Branch(children) => children,
                Node::Leaf(_) => break,
            };
            if children.len() < self.capacity(ancestor)
                || !children.values().all(|c| self.dead.contains(c))
            {
                break;
            }
            self.dead.insert(ancestor);
        }
    }

    /// Cheap check of whether running `buffer` could teach us anything. `false` means the buffer
    /// provably repeats known behaviour (or overruns a known block).
    pub fn prescreen(&self, buffer: &[u8]) -> bool {
        let mut node = ROOT;
        for (i, &byte) in buffer.iter().enumerate() {
            if self.is_dead(node) {
                return false;
            }
            if let Some(&size) = self.block_sizes.get(&node) {
                if i + size > buffer.len() {
                    return false;
                }
            }
            match self.child(node, self.effective_byte(node, byte)) {
                Some(child) => node = child,
                None => return true,
            }
        }
        false
    }

    /// Previously recorded outcome of `buffer`, if replaying it is guaranteed to reproduce one.
    pub fn lookup(&self, buffer: &[u8]) -> Option<Arc<ConjectureResult>> {
        let mut node = ROOT;
        let mut bytes = buffer.iter();
        loop {
            match &self.nodes[node] {
                Node::Leaf(result) => return Some(Arc::clone(result)),
                Node::Branch(children) => {
                    let byte = *bytes.next()?;
                    node = *children.get(&self.effective_byte(node, byte))?;
                }
            }
        }
    }

    /// Advance `cursor` over bytes committed since the last call.
    fn catch_up(&self, cursor: &mut NoveltyCursor, committed: &[u8]) {
        while !cursor.hit_novelty && cursor.evaluated_to < committed.len() {
            if self.is_dead(cursor.node) {
                // Nothing reachable from here can be novel; stop steering this execution.
                cursor.hit_novelty = true;
                break;
            }
            let byte = committed[cursor.evaluated_to];
            match self.child(cursor.node, self.effective_byte(cursor.node, byte)) {
                Some(child) => {
                    cursor.node = child;
                    cursor.evaluated_to += 1;
                }
                None => cursor.hit_novelty = true,
            }
        }
    }

    /// Adjust a proposed block so that it does not lead into a dead subtree.
    ///
    /// `committed` is everything the execution has committed so far. The first position in the
    /// block whose byte leads to a dead child is replaced by the smallest admissible value whose
    /// child is missing or alive. Once an execution has left the known tree its blocks are passed
    /// through untouched.
    pub fn rewrite_for_novelty(
        &self,
        cursor: &mut NoveltyCursor,
        committed: &[u8],
        mut block: Vec<u8>,
    ) -> Vec<u8> {
        self.catch_up(cursor, committed);
        if cursor.hit_novelty || self.is_dead(cursor.node) {
            return block;
        }

        let mut node = cursor.node;
        'bytes: for i in 0..block.len() {
            block[i] = self.effective_byte(node, block[i]);
            let children = match &self.nodes[node] {
                Node::Branch(children) => children,
                Node::Leaf(_) => return block,
            };
            match children.get(&block[i]) {
                None => {
                    cursor.hit_novelty = true;
                    return block;
                }
                Some(&child) if !self.is_dead(child) => {
                    node = child;
                    continue 'bytes;
                }
                Some(_) => {}
            }

            let candidates = match self.forced.get(&node) {
                Some(&forced) => forced..=forced,
                None => 0..=(self.capacity(node) - 1) as u8,
            };
            for value in candidates {
                match children.get(&value) {
                    None => {
                        block[i] = value;
                        cursor.hit_novelty = true;
                        return block;
                    }
                    Some(&child) if !self.is_dead(child) => {
                        block[i] = value;
                        node = child;
                        continue 'bytes;
                    }
                    Some(_) => {}
                }
            }
            panic!(
                "DataTree invariant violated: live node {} has only dead children",
                node
            );
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ConjectureData;

    fn run(buffer: &[u8], draws: &[usize], status: Status) -> Arc<ConjectureResult> {
        let mut data = ConjectureData::for_buffer(buffer.to_vec());
        for &n in draws {
            if data.draw_bytes(n).is_err() {
                break;
            }
        }
        match status {
            Status::Invalid => {
                data.mark_invalid();
            }
            Status::Interesting => {
                data.mark_interesting("test");
            }
            _ => data.freeze(),
        }
        Arc::new(data.as_result())
    }

    #[test]
    fn test_record_marks_leaf_dead() {
        let mut tree = DataTree::new();
        let node = tree.record(&run(&[1, 2], &[1, 1], Status::Valid));
        assert!(tree.is_dead(node));
        assert!(!tree.is_exhausted());
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn test_overrun_is_not_a_leaf() {
        let mut tree = DataTree::new();
        let node = tree.record(&run(&[1], &[1, 1], Status::Valid));
        assert!(!tree.is_dead(node));
        assert_eq!(tree.dead_count(), 0);
    }

    #[test]
    fn test_capped_position_exhausts() {
        let mut tree = DataTree::new();
        for value in 0..=2u8 {
            let mut data = ConjectureData::for_buffer(vec![value]);
            data.draw_capped_byte(2).unwrap();
            data.freeze();
            tree.record(&Arc::new(data.as_result()));
        }
        assert!(tree.is_exhausted());
    }

    #[test]
    fn test_forced_position_has_capacity_one() {
        let mut tree = DataTree::new();
        let mut data = ConjectureData::for_buffer(vec![0]);
        data.write(&[7]).unwrap();
        data.freeze();
        tree.record(&Arc::new(data.as_result()));
        assert!(tree.is_exhausted());
    }

    #[test]
    fn test_prescreen_rejects_known_buffers() {
        let mut tree = DataTree::new();
        tree.record(&run(&[1, 2], &[1, 1], Status::Valid));
        assert!(!tree.prescreen(&[1, 2]));
        assert!(!tree.prescreen(&[1, 2, 3]));
        assert!(tree.prescreen(&[1, 3]));
        assert!(tree.prescreen(&[0, 0]));
    }

    #[test]
    fn test_prescreen_respects_block_sizes() {
        let mut tree = DataTree::new();
        tree.record(&run(&[1, 2, 3], &[1, 2], Status::Valid));
        // The block starting at offset 1 is two bytes long, so a two byte buffer cannot fit it.
        assert!(!tree.prescreen(&[1, 9]));
        assert!(tree.prescreen(&[1, 9, 9]));
    }

    #[test]
    fn test_rewrite_avoids_dead_children() {
        let mut tree = DataTree::new();
        tree.record(&run(&[0], &[1], Status::Valid));
        tree.record(&run(&[1], &[1], Status::Valid));
        let mut cursor = NoveltyCursor::new();
        let block = tree.rewrite_for_novelty(&mut cursor, &[], vec![0]);
        assert_eq!(block, vec![2]);
        assert!(cursor.hit_novelty());
    }

    #[test]
    fn test_rewrite_passes_through_after_novelty() {
        let mut tree = DataTree::new();
        tree.record(&run(&[5, 5], &[1, 1], Status::Valid));
        let mut cursor = NoveltyCursor::new();
        assert_eq!(tree.rewrite_for_novelty(&mut cursor, &[], vec![6]), vec![6]);
        assert_eq!(tree.rewrite_for_novelty(&mut cursor, &[6], vec![5]), vec![5]);
    }

    #[test]
    fn test_rewrite_follows_committed_prefix() {
        let mut tree = DataTree::new();
        tree.record(&run(&[3, 0], &[1, 1], Status::Valid));
        let mut cursor = NoveltyCursor::new();
        assert_eq!(tree.rewrite_for_novelty(&mut cursor, &[], vec![3]), vec![3]);
        assert!(!cursor.hit_novelty());
        assert_eq!(tree.rewrite_for_novelty(&mut cursor, &[3], vec![0]), vec![1]);
    }

    #[test]
    fn test_lookup_returns_recorded_leaf() {
        let mut tree = DataTree::new();
        let result = run(&[4], &[1], Status::Interesting);
        tree.record(&result);
        let found = tree.lookup(&[4, 9]).expect("prefix reaches the leaf");
        assert_eq!(found.buffer, vec![4]);
        assert!(tree.lookup(&[5]).is_none());
        assert!(tree.lookup(&[]).is_none());
    }
}
