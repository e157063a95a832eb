//! Time-structured trees and tree-like graphs.
//!
//! [`TreeView`] is the read-only interface the engine consumes. The MCMC
//! driver owns the real tree; the engine only reads heights and links and
//! reacts to change notifications.
//!
//! [`TimeTree`] is an arena-backed implementation: nodes live in a flat
//! `Vec<Node>` and are referenced by `NodeId` (a `usize` index). A node may
//! have two parents, which makes the structure an ancestral recombination
//! graph rather than a strict tree.

use arbora_core::{ArboraError, Result, Summarizable};

/// Index into the tree's node arena. Stable for the life of a topology.
pub type NodeId = usize;

/// Read access to a rooted, time-structured tree or recombination graph.
///
/// Heights grow towards the root. All methods take node ids in
/// `0..node_count()`. Implementations are shared read-only across worker
/// threads when partitions are evaluated in parallel.
pub trait TreeView: Sync {
    /// Number of nodes, including nodes currently detached from the root.
    fn node_count(&self) -> usize;

    /// The root node.
    fn root(&self) -> NodeId;

    /// The first (or only) parent; `None` for the root.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Number of parents: 0 for the root, 2 for a recombination node.
    fn parent_count(&self, node: NodeId) -> usize {
        usize::from(self.parent(node).is_some())
    }

    /// The `index`-th parent.
    fn parent_at(&self, node: NodeId, index: usize) -> Option<NodeId> {
        if index == 0 {
            self.parent(node)
        } else {
            None
        }
    }

    /// Number of children.
    fn child_count(&self, node: NodeId) -> usize;

    /// The `index`-th child.
    fn child(&self, node: NodeId, index: usize) -> NodeId;

    /// Height (time before the most recent sample) of a node.
    fn height(&self, node: NodeId) -> f64;

    /// True for tips.
    fn is_external(&self, node: NodeId) -> bool {
        self.child_count(node) == 0
    }

    /// Length of the branch to the first parent; `0.0` for the root.
    fn branch_length(&self, node: NodeId) -> f64 {
        match self.parent(node) {
            Some(p) => self.height(p) - self.height(node),
            None => 0.0,
        }
    }

    /// Number of tips.
    fn external_count(&self) -> usize {
        (0..self.node_count())
            .filter(|&n| self.is_external(n))
            .count()
    }

    /// Number of nodes with more than one parent.
    fn recombination_count(&self) -> usize {
        (0..self.node_count())
            .filter(|&n| self.parent_count(n) > 1)
            .count()
    }
}

/// A single node in a time tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parents, first parent first. Empty for the root.
    pub parents: Vec<NodeId>,
    /// Child nodes, in order.
    pub children: Vec<NodeId>,
    /// Node height.
    pub height: f64,
    /// Taxon or clade label.
    pub name: Option<String>,
}

impl Node {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// True if this node has two parents.
    pub fn is_recombination(&self) -> bool {
        self.parents.len() > 1
    }
}

/// A rooted time tree (or recombination graph) stored as an arena of nodes.
#[derive(Debug, Clone)]
pub struct TimeTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl TimeTree {
    /// Create a tree with a single unnamed root at `root_height`.
    pub fn new(root_height: f64) -> Self {
        Self {
            nodes: vec![Node {
                id: 0,
                parents: Vec::new(),
                children: Vec::new(),
                height: root_height,
                name: None,
            }],
            root: 0,
        }
    }

    /// Create a tree from pre-built nodes and a root index.
    ///
    /// Parent and child links must agree and every id must be in range.
    pub fn from_nodes(nodes: Vec<Node>, root: NodeId) -> Result<Self> {
        if nodes.is_empty() {
            return Err(ArboraError::InvalidInput("empty node list".into()));
        }
        let n = nodes.len();
        if root >= n {
            return Err(ArboraError::InvalidInput(format!(
                "root index {} out of range ({})",
                root, n
            )));
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.id != i {
                return Err(ArboraError::InvalidInput(format!(
                    "node at index {} carries id {}",
                    i, node.id
                )));
            }
            for &c in &node.children {
                if c >= n || !nodes[c].parents.contains(&i) {
                    return Err(ArboraError::topology(format!(
                        "child link {} -> {} has no matching parent link",
                        i, c
                    )));
                }
            }
            for &p in &node.parents {
                if p >= n || !nodes[p].children.contains(&i) {
                    return Err(ArboraError::topology(format!(
                        "parent link {} -> {} has no matching child link",
                        i, p
                    )));
                }
            }
        }
        if !nodes[root].parents.is_empty() {
            return Err(ArboraError::topology("root has a parent"));
        }
        Ok(Self { nodes, root })
    }

    /// Add a child to `parent` at `height` and return its `NodeId`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        height: f64,
    ) -> Result<NodeId> {
        self.check(parent)?;
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            parents: vec![parent],
            children: Vec::new(),
            height,
            name,
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Give `node` a second parent, turning it into a recombination node.
    pub fn add_second_parent(&mut self, node: NodeId, parent: NodeId) -> Result<()> {
        self.check(node)?;
        self.check(parent)?;
        if self.nodes[node].parents.len() != 1 {
            return Err(ArboraError::topology(format!(
                "node {} must have exactly one parent to gain a second",
                node
            )));
        }
        if self.nodes[node].parents[0] == parent || node == parent {
            return Err(ArboraError::topology(format!(
                "node {} already hangs below {}",
                node, parent
            )));
        }
        self.nodes[node].parents.push(parent);
        self.nodes[parent].children.push(node);
        Ok(())
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Set the height of a node.
    pub fn set_height(&mut self, id: NodeId, height: f64) -> Result<()> {
        self.check(id)?;
        self.nodes[id].height = height;
        Ok(())
    }

    /// Exchange two subtrees between their (first) parents.
    ///
    /// Neither node may be an ancestor of the other. Node count is unchanged.
    pub fn swap_subtrees(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        self.check(a)?;
        self.check(b)?;
        let pa = self.nodes[a]
            .parents
            .first()
            .copied()
            .ok_or_else(|| ArboraError::topology("cannot swap the root"))?;
        let pb = self.nodes[b]
            .parents
            .first()
            .copied()
            .ok_or_else(|| ArboraError::topology("cannot swap the root"))?;
        if pa == pb {
            return Ok(());
        }
        if self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            return Err(ArboraError::topology(format!(
                "nodes {} and {} are on one lineage",
                a, b
            )));
        }
        replace_first(&mut self.nodes[pa].children, a, b);
        replace_first(&mut self.nodes[pb].children, b, a);
        self.nodes[a].parents[0] = pb;
        self.nodes[b].parents[0] = pa;
        Ok(())
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// All leaf node ids.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// True if `ancestor` lies on some path from `node` to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut stack: Vec<NodeId> = self.nodes[node].parents.clone();
        let mut seen = vec![false; self.nodes.len()];
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            stack.extend_from_slice(&self.nodes[id].parents);
        }
        false
    }

    /// Pre-order (parent before children) traversal. Nodes reachable along
    /// several paths are yielded once.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root],
            seen: vec![false; self.nodes.len()],
        }
    }

    /// Post-order (children before parent) traversal.
    pub fn iter_postorder(&self) -> impl Iterator<Item = NodeId> {
        let mut order: Vec<NodeId> = Vec::with_capacity(self.nodes.len());
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            order.push(id);
            stack.extend_from_slice(&self.nodes[id].children);
        }
        order.reverse();
        order.into_iter()
    }

    /// A complete binary tree with `2^depth` tips at height 0 and internal
    /// nodes at `level * unit`.
    pub fn balanced(depth: u32, unit: f64) -> Self {
        let mut tree = TimeTree::new(depth as f64 * unit);
        let mut frontier = vec![tree.root];
        for level in (0..depth).rev() {
            let mut next = Vec::with_capacity(frontier.len() * 2);
            for &parent in &frontier {
                for _ in 0..2 {
                    let id = tree.nodes.len();
                    tree.nodes.push(Node {
                        id,
                        parents: vec![parent],
                        children: Vec::new(),
                        height: level as f64 * unit,
                        name: (level == 0).then(|| format!("t{}", id)),
                    });
                    tree.nodes[parent].children.push(id);
                    next.push(id);
                }
            }
            frontier = next;
        }
        tree
    }

    /// A caterpillar ("ladder") tree with `tips` contemporaneous tips.
    pub fn caterpillar(tips: usize, unit: f64) -> Result<Self> {
        if tips < 2 {
            return Err(ArboraError::InvalidInput(
                "caterpillar needs at least two tips".into(),
            ));
        }
        let mut tree = TimeTree::new((tips - 1) as f64 * unit);
        let mut spine = tree.root;
        for k in (1..tips).rev() {
            tree.add_child(spine, Some(format!("t{}", k)), 0.0)?;
            if k == 1 {
                tree.add_child(spine, Some("t0".into()), 0.0)?;
            } else {
                spine = tree.add_child(spine, None, (k - 1) as f64 * unit)?;
            }
        }
        Ok(tree)
    }

    fn check(&self, id: NodeId) -> Result<()> {
        if id >= self.nodes.len() {
            return Err(ArboraError::InvalidInput(format!(
                "node index {} out of range ({})",
                id,
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

fn replace_first(ids: &mut [NodeId], from: NodeId, to: NodeId) {
    if let Some(slot) = ids.iter_mut().find(|id| **id == from) {
        *slot = to;
    }
}

impl TreeView for TimeTree {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn root(&self) -> NodeId {
        self.root
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parents.first().copied()
    }

    fn parent_count(&self, node: NodeId) -> usize {
        self.nodes[node].parents.len()
    }

    fn parent_at(&self, node: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[node].parents.get(index).copied()
    }

    fn child_count(&self, node: NodeId) -> usize {
        self.nodes[node].children.len()
    }

    fn child(&self, node: NodeId, index: usize) -> NodeId {
        self.nodes[node].children[index]
    }

    fn height(&self, node: NodeId) -> f64 {
        self.nodes[node].height
    }
}

impl Summarizable for TimeTree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        let recombinations = self.recombination_count();
        format!(
            "TimeTree: {} nodes ({} leaves, {} recombinations), height {}",
            self.node_count(),
            leaves,
            recombinations,
            self.nodes[self.root].height
        )
    }
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a TimeTree,
    stack: Vec<NodeId>,
    seen: Vec<bool>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.stack.pop()?;
            if std::mem::replace(&mut self.seen[id], true) {
                continue;
            }
            // Push children in reverse order so leftmost is visited first.
            for &child in self.tree.nodes[id].children.iter().rev() {
                self.stack.push(child);
            }
            return Some(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> TimeTree {
        // ((A,B)AB@1,(C,D)CD@1.5)root@3
        let mut tree = TimeTree::new(3.0);
        let ab = tree.add_child(0, Some("AB".into()), 1.0).unwrap();
        let cd = tree.add_child(0, Some("CD".into()), 1.5).unwrap();
        tree.add_child(ab, Some("A".into()), 0.0).unwrap();
        tree.add_child(ab, Some("B".into()), 0.2).unwrap();
        tree.add_child(cd, Some("C".into()), 0.0).unwrap();
        tree.add_child(cd, Some("D".into()), 0.5).unwrap();
        tree
    }

    #[test]
    fn new_tree_has_single_root() {
        let tree = TimeTree::new(0.0);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.leaf_count(), 1);
        assert!(tree.get_node(0).unwrap().is_root());
    }

    #[test]
    fn add_child_links_both_ways() {
        let tree = sample_tree();
        assert_eq!(TreeView::parent(&tree, 3), Some(1));
        assert_eq!(tree.child_count(1), 2);
        assert_eq!(tree.child(0, 1), 2);
    }

    #[test]
    fn add_child_invalid_parent() {
        let mut tree = TimeTree::new(1.0);
        assert!(tree.add_child(99, None, 0.0).is_err());
    }

    #[test]
    fn branch_lengths_follow_heights() {
        let tree = sample_tree();
        assert!((tree.branch_length(1) - 2.0).abs() < 1e-12);
        assert!((tree.branch_length(4) - 0.8).abs() < 1e-12);
        assert_eq!(tree.branch_length(0), 0.0);
    }

    #[test]
    fn counts() {
        let tree = sample_tree();
        assert_eq!(tree.external_count(), 4);
        assert_eq!(tree.recombination_count(), 0);
        assert_eq!(tree.leaves(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn preorder_and_postorder() {
        let tree = sample_tree();
        let pre: Vec<NodeId> = tree.iter_preorder().collect();
        assert_eq!(pre, vec![0, 1, 3, 4, 2, 5, 6]);
        let post: Vec<NodeId> = tree.iter_postorder().collect();
        assert_eq!(post.last(), Some(&0));
        assert_eq!(post.len(), 7);
    }

    #[test]
    fn second_parent_makes_recombination() {
        let mut tree = sample_tree();
        tree.add_second_parent(4, 2).unwrap();
        assert_eq!(tree.recombination_count(), 1);
        assert_eq!(tree.parent_at(4, 1), Some(2));
        assert!(tree.get_node(4).unwrap().is_recombination());
        // Reached twice, yielded once.
        assert_eq!(tree.iter_preorder().count(), 7);
        assert!(tree.add_second_parent(4, 0).is_err());
    }

    #[test]
    fn swap_subtrees_exchanges_parents() {
        let mut tree = sample_tree();
        tree.swap_subtrees(4, 5).unwrap();
        assert_eq!(TreeView::parent(&tree, 4), Some(2));
        assert_eq!(TreeView::parent(&tree, 5), Some(1));
        assert_eq!(tree.get_node(1).unwrap().children, vec![3, 5]);
        assert!(tree.swap_subtrees(1, 3).is_err());
    }

    #[test]
    fn balanced_tree_shape() {
        let tree = TimeTree::balanced(3, 1.0);
        assert_eq!(tree.node_count(), 15);
        assert_eq!(tree.leaf_count(), 8);
        assert_eq!(tree.height(tree.root()), 3.0);
        assert!(tree.leaves().iter().all(|&l| tree.height(l) == 0.0));
    }

    #[test]
    fn caterpillar_shape() {
        let tree = TimeTree::caterpillar(5, 0.5).unwrap();
        assert_eq!(tree.leaf_count(), 5);
        assert_eq!(tree.node_count(), 9);
        assert_eq!(tree.height(tree.root()), 2.0);
        assert!(TimeTree::caterpillar(1, 1.0).is_err());
    }

    #[test]
    fn from_nodes_rejects_one_sided_links() {
        let nodes = vec![
            Node {
                id: 0,
                parents: vec![],
                children: vec![1],
                height: 1.0,
                name: None,
            },
            Node {
                id: 1,
                parents: vec![],
                children: vec![],
                height: 0.0,
                name: None,
            },
        ];
        assert!(TimeTree::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn summary_format() {
        let tree = sample_tree();
        assert_eq!(
            tree.summary(),
            "TimeTree: 7 nodes (4 leaves, 0 recombinations), height 3"
        );
    }
}
