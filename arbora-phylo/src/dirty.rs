//! Per-node evaluation cache and dirty-flag propagation.
//!
//! The cache keeps one checkpointed [`CacheEntry`] per node. A node is dirty
//! when its entry may be stale. Dirtiness always propagates to every
//! ancestor, so a clean node never has a dirty descendant and evaluation can
//! stop at the first clean node it meets.

use crate::checkpoint::{Checkpointed, DoubleBuffer};
use crate::tree::{NodeId, TreeView};

/// Cached values for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    /// Contribution of the node's own branch (and any second-parent edges
    /// ending at it).
    pub own: f64,
    /// `own` plus the totals of the children reached through their first
    /// parent.
    pub total: f64,
    pub dirty: bool,
}

impl CacheEntry {
    pub const DIRTY: CacheEntry = CacheEntry {
        own: 0.0,
        total: 0.0,
        dirty: true,
    };
}

/// Node-indexed, double-buffered cache of branch contributions.
#[derive(Debug, Clone)]
pub struct EvaluationCache {
    entries: DoubleBuffer<CacheEntry>,
}

impl EvaluationCache {
    /// A cache for `len` nodes with every node dirty.
    pub fn new(len: usize) -> Self {
        Self {
            entries: DoubleBuffer::new(len, CacheEntry::DIRTY),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, node: NodeId) -> CacheEntry {
        self.entries.get(node)
    }

    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.entries.get(node).dirty
    }

    pub fn own(&self, node: NodeId) -> f64 {
        self.entries.get(node).own
    }

    pub fn total(&self, node: NodeId) -> f64 {
        self.entries.get(node).total
    }

    /// Record a fresh evaluation and clear the node's dirty flag.
    pub fn store(&mut self, node: NodeId, own: f64, total: f64) {
        self.entries.set(
            node,
            CacheEntry {
                own,
                total,
                dirty: false,
            },
        );
    }

    /// Set a single dirty flag without propagation.
    pub fn set_dirty(&mut self, node: NodeId) {
        self.entries.update(node, |e| CacheEntry { dirty: true, ..e });
    }

    /// Number of dirty nodes.
    pub fn dirty_count(&self) -> usize {
        (0..self.entries.len()).filter(|&i| self.is_dirty(i)).count()
    }

    /// Reallocate for `len` nodes, all dirty.
    pub fn resize(&mut self, len: usize) {
        self.entries.resize(len, CacheEntry::DIRTY);
    }

    pub(crate) fn fill_dirty(&mut self) {
        for i in 0..self.entries.len() {
            if !self.is_dirty(i) {
                self.set_dirty(i);
            }
        }
    }
}

impl Checkpointed for EvaluationCache {
    fn begin(&mut self) {
        self.entries.begin();
    }

    fn commit(&mut self) {
        self.entries.commit();
    }

    fn rollback(&mut self) {
        self.entries.rollback();
    }
}

/// Marks cache entries stale after tree or parameter changes.
///
/// Holds only its traversal scratch space; the flags live in the
/// [`EvaluationCache`].
#[derive(Debug, Clone, Default)]
pub struct DirtyPropagator {
    stack: Vec<NodeId>,
}

impl DirtyPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node` and all of its ancestors dirty, following every parent.
    ///
    /// Stops at nodes that are already dirty: their ancestors are dirty too.
    /// Returns how many flags were newly set.
    pub fn mark_dirty(
        &mut self,
        cache: &mut EvaluationCache,
        tree: &dyn TreeView,
        node: NodeId,
    ) -> usize {
        let mut marked = 0;
        self.stack.clear();
        self.stack.push(node);
        while let Some(v) = self.stack.pop() {
            if cache.is_dirty(v) {
                continue;
            }
            cache.set_dirty(v);
            marked += 1;
            for k in 0..tree.parent_count(v) {
                if let Some(p) = tree.parent_at(v, k) {
                    self.stack.push(p);
                }
            }
        }
        marked
    }

    /// Mark `node`, its ancestors and its direct children dirty.
    ///
    /// Used when a node's height moves: its own branch and every branch
    /// hanging from it change length.
    pub fn mark_dirty_with_children(
        &mut self,
        cache: &mut EvaluationCache,
        tree: &dyn TreeView,
        node: NodeId,
    ) -> usize {
        let mut marked = self.mark_dirty(cache, tree, node);
        for i in 0..tree.child_count(node) {
            let child = tree.child(node, i);
            if !cache.is_dirty(child) {
                // The child's ancestors are already dirty via `node`.
                cache.set_dirty(child);
                marked += 1;
            }
        }
        marked
    }

    /// Mark every node dirty.
    pub fn mark_all(&mut self, cache: &mut EvaluationCache) {
        cache.fill_dirty();
    }
}
