//! Incremental evaluation of a sum of per-branch log-contributions.
//!
//! [`IncrementalEvaluator`] caches each node's own contribution and subtree
//! total. After a change only the dirty nodes are recomputed: an explicit
//! post-order walk descends from the root into dirty children and stops at
//! clean ones, so a single-node change costs O(depth).
//!
//! In a recombination graph a node with two parents is counted in the subtree
//! total of its first parent only. The edge to its second parent is scored as
//! part of that parent's own contribution.
//!
//! Infeasible states (too many recombinations, unreachable nodes, a child
//! above its parent) score `-inf`. A NaN contribution is an error and leaves
//! the offending node dirty.

use std::fmt;

use arbora_core::{ArboraError, Result};
use tracing::{debug, trace};

use crate::checkpoint::{CachedScalar, CheckpointManager, Checkpointed, Swappable};
use crate::config::{EngineConfig, RootPolicy};
use crate::dirty::{DirtyPropagator, EvaluationCache};
use crate::intervals::{IntervalList, TreeIntervals};
use crate::model::{ModelLikelihood, TreeChange};
use crate::tree::{NodeId, TreeView};

/// The branch being scored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Branch {
    /// Lower end of the branch.
    pub node: NodeId,
    /// Upper end, `None` for the root.
    pub parent: Option<NodeId>,
    pub length: f64,
    /// A sibling branch merged into this one, with its length. Set for the
    /// branch joining the two root children under [`RootPolicy::IgnoreRoot`].
    pub pooled: Option<(NodeId, f64)>,
}

impl Branch {
    /// Length including any pooled sibling.
    pub fn total_length(&self) -> f64 {
        self.length + self.pooled.map_or(0.0, |(_, l)| l)
    }
}

/// Supplies the log-contribution of a single branch.
///
/// Implementations must be pure in the tree and their own parameters.
/// Return `f64::NEG_INFINITY` for an impossible branch; NaN is treated as a
/// numerical anomaly.
pub trait BranchContributionProvider: Send + Sync {
    fn contribution(&self, tree: &dyn TreeView, branch: &Branch) -> f64;

    /// Per-node rate, if the model has one. Used to derive the root rate
    /// under [`RootPolicy::PoolChildren`].
    fn rate(&self, _node: NodeId) -> Option<f64> {
        None
    }

    /// Contribution of the root itself under [`RootPolicy::Normal`].
    fn root_contribution(&self, _tree: &dyn TreeView, _root: NodeId, _root_rate: f64) -> f64 {
        0.0
    }

    /// Contribution of a root child scored against a derived root rate.
    fn root_child_contribution(&self, tree: &dyn TreeView, branch: &Branch, _root_rate: f64) -> f64 {
        self.contribution(tree, branch)
    }
}

/// Counters for cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Calls to [`IncrementalEvaluator::evaluate`].
    pub evaluations: u64,
    /// Nodes recomputed by the most recent evaluation.
    pub recomputed_last: usize,
    /// Nodes recomputed over the evaluator's lifetime.
    pub recomputed_total: u64,
    /// Likelihood requests that came back `-inf`.
    pub rejections: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RootIds {
    root: Option<NodeId>,
    first: Option<NodeId>,
    second: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Structure {
    Unchecked,
    Feasible,
    Infeasible,
}

/// Incrementally evaluated, checkpointed branch likelihood.
pub struct IncrementalEvaluator<P: ?Sized = dyn BranchContributionProvider> {
    name: String,
    config: EngineConfig,
    cache: EvaluationCache,
    dirty: DirtyPropagator,
    total: Swappable<CachedScalar>,
    roots: Swappable<RootIds>,
    structure: Swappable<Structure>,
    intervals: TreeIntervals,
    checkpoint: CheckpointManager,
    stats: EvaluationStats,
    stack: Vec<(NodeId, bool)>,
    provider: Box<P>,
}

impl<P: ?Sized> fmt::Debug for IncrementalEvaluator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalEvaluator")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("phase", &self.checkpoint.phase())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<P: BranchContributionProvider + ?Sized> IncrementalEvaluator<P> {
    pub fn new(provider: Box<P>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let intervals = TreeIntervals::new(config.intervals.clone())?;
        Ok(Self {
            name: String::from("branch-likelihood"),
            config,
            cache: EvaluationCache::new(0),
            dirty: DirtyPropagator::new(),
            total: Swappable::new(CachedScalar::UNKNOWN),
            roots: Swappable::new(RootIds::default()),
            structure: Swappable::new(Structure::Unchecked),
            intervals,
            checkpoint: CheckpointManager::new(),
            stats: EvaluationStats::default(),
            stack: Vec::new(),
            provider,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Mutable access to the provider's parameters. Report what changed
    /// through [`ModelLikelihood::handle_tree_change`].
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn stats(&self) -> EvaluationStats {
        self.stats
    }

    pub fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    /// The interval decomposition of `tree`, rebuilt only after a height or
    /// topology change.
    pub fn intervals(&mut self, tree: &dyn TreeView) -> Result<&IntervalList> {
        self.intervals.intervals(tree)
    }

    /// Mark `node` and its ancestors for recomputation.
    pub fn mark_dirty(&mut self, tree: &dyn TreeView, node: NodeId) {
        self.ensure_capacity(tree);
        if node < self.cache.len() {
            self.dirty.mark_dirty(&mut self.cache, tree, node);
            self.total.invalidate();
        }
    }

    /// Recompute dirty nodes and return the root's subtree total.
    ///
    /// Does not consult the structural checks or the cached aggregate; see
    /// [`ModelLikelihood::log_likelihood`] for the full request.
    pub fn evaluate(&mut self, tree: &dyn TreeView) -> Result<f64> {
        self.ensure_capacity(tree);
        self.sync_roots(tree);
        self.apply_root_policy(tree);
        let roots = *self.roots.get();
        let pooled_rate = self.pooled_root_rate(tree);

        let mut stack = std::mem::take(&mut self.stack);
        let result = self.post_order(tree, &roots, pooled_rate, &mut stack);
        self.stack = stack;

        let recomputed = result?;
        self.stats.evaluations += 1;
        self.stats.recomputed_last = recomputed;
        self.stats.recomputed_total += recomputed as u64;
        let total = self.cache.total(tree.root());
        trace!(model = %self.name, recomputed, total, "evaluated branch contributions");
        Ok(total)
    }

    fn post_order(
        &mut self,
        tree: &dyn TreeView,
        roots: &RootIds,
        pooled_rate: Option<f64>,
        stack: &mut Vec<(NodeId, bool)>,
    ) -> Result<usize> {
        let policy = self.config.root_policy;
        let mut recomputed = 0;
        stack.clear();
        stack.push((tree.root(), false));

        while let Some((v, expanded)) = stack.pop() {
            if !expanded {
                if !self.cache.is_dirty(v) {
                    continue;
                }
                stack.push((v, true));
                for i in 0..tree.child_count(v) {
                    let c = tree.child(v, i);
                    if tree.parent(c) == Some(v) && self.cache.is_dirty(c) {
                        stack.push((c, false));
                    }
                }
                continue;
            }

            let own = own_contribution(&*self.provider, policy, tree, v, roots, pooled_rate);
            let mut total = own;
            for i in 0..tree.child_count(v) {
                let c = tree.child(v, i);
                if tree.parent(c) == Some(v) {
                    total += self.cache.total(c);
                }
            }
            if total.is_nan() {
                return Err(ArboraError::nan_at(v, "branch contribution"));
            }
            self.cache.store(v, own, total);
            recomputed += 1;
        }
        Ok(recomputed)
    }

    fn ensure_capacity(&mut self, tree: &dyn TreeView) {
        let n = tree.node_count();
        let old = self.cache.len();
        if old != n {
            debug!(model = %self.name, nodes = n, "resized evaluation cache");
            self.cache.resize(n);
            self.structure.set(Structure::Unchecked);
            // First sight of a tree: intervals already built for it stay.
            if old != 0 {
                self.intervals.invalidate();
            }
            self.total.invalidate();
        }
    }

    // A node that gains or loses the root or root-child role changes how it
    // is scored.
    fn sync_roots(&mut self, tree: &dyn TreeView) {
        let root = tree.root();
        let children = tree.child_count(root);
        let current = RootIds {
            root: Some(root),
            first: (children > 0).then(|| tree.child(root, 0)),
            second: (children > 1).then(|| tree.child(root, 1)),
        };
        let cached = *self.roots.get();
        if cached == current {
            return;
        }
        let ids = [
            cached.root,
            cached.first,
            cached.second,
            current.root,
            current.first,
            current.second,
        ];
        for id in ids.into_iter().flatten() {
            if id < self.cache.len() {
                self.dirty.mark_dirty(&mut self.cache, tree, id);
            }
        }
        if cached.root.is_some() && cached.root != current.root {
            debug!(model = %self.name, old = ?cached.root, new = root, "root changed");
        }
        self.roots.set(current);
    }

    // Root children scored against a shared rate are recomputed together.
    // The pooled branch of IgnoreRoot lives on the root, which is dirty
    // whenever anything below it is.
    fn apply_root_policy(&mut self, tree: &dyn TreeView) {
        if self.config.root_policy != RootPolicy::PoolChildren {
            return;
        }
        let root = tree.root();
        let n = tree.child_count(root);
        if (0..n).any(|i| self.cache.is_dirty(tree.child(root, i))) {
            for i in 0..n {
                self.cache.set_dirty(tree.child(root, i));
            }
        }
    }

    fn pooled_root_rate(&self, tree: &dyn TreeView) -> Option<f64> {
        if self.config.root_policy != RootPolicy::PoolChildren {
            return None;
        }
        let root = tree.root();
        let n = tree.child_count(root);
        if n == 0 {
            return None;
        }
        let mut sum = 0.0;
        for i in 0..n {
            sum += self.provider.rate(tree.child(root, i))?;
        }
        Some(sum / n as f64)
    }

    fn check_structure(&self, tree: &dyn TreeView) -> Structure {
        if let Some(max) = self.config.max_recombinations {
            let count = tree.recombination_count();
            if count > max {
                trace!(model = %self.name, count, max, "rejected: too many recombinations");
                return Structure::Infeasible;
            }
        }
        if self.config.check_reachability {
            let n = tree.node_count();
            let root = tree.root();
            let mut seen = vec![false; n];
            let mut stack = vec![root];
            seen[root] = true;
            let mut reached = 1;
            while let Some(v) = stack.pop() {
                for i in 0..tree.child_count(v) {
                    let c = tree.child(v, i);
                    if tree.height(c) > tree.height(v) {
                        trace!(model = %self.name, node = c, parent = v, "rejected: child above parent");
                        return Structure::Infeasible;
                    }
                    if !seen[c] {
                        seen[c] = true;
                        reached += 1;
                        stack.push(c);
                    }
                }
            }
            if reached != n {
                trace!(model = %self.name, reached, nodes = n, "rejected: unreachable nodes");
                return Structure::Infeasible;
            }
        }
        Structure::Feasible
    }

    fn mark_with_children(&mut self, tree: &dyn TreeView, node: NodeId) {
        if node < self.cache.len() {
            self.dirty
                .mark_dirty_with_children(&mut self.cache, tree, node);
        } else {
            trace!(model = %self.name, node, "ignored change to unknown node");
        }
    }
}

fn own_contribution<P: BranchContributionProvider + ?Sized>(
    provider: &P,
    policy: RootPolicy,
    tree: &dyn TreeView,
    v: NodeId,
    roots: &RootIds,
    pooled_rate: Option<f64>,
) -> f64 {
    let mut own = match tree.parent(v) {
        None => match policy {
            RootPolicy::Normal { root_rate } => provider.root_contribution(tree, v, root_rate),
            RootPolicy::IgnoreRoot => match pooled_root_branch(tree, v, roots) {
                Some(branch)
                    if branch.length < 0.0 || branch.pooled.is_some_and(|(_, l)| l < 0.0) =>
                {
                    return f64::NEG_INFINITY;
                }
                Some(branch) => provider.contribution(tree, &branch),
                None => 0.0,
            },
            RootPolicy::PoolChildren => 0.0,
        },
        Some(parent) => {
            let length = tree.height(parent) - tree.height(v);
            if length < 0.0 {
                return f64::NEG_INFINITY;
            }
            let branch = Branch {
                node: v,
                parent: Some(parent),
                length,
                pooled: None,
            };
            let at_root = roots.root == Some(parent);
            match policy {
                RootPolicy::IgnoreRoot
                    if at_root && (roots.first == Some(v) || roots.second == Some(v)) =>
                {
                    0.0
                }
                RootPolicy::PoolChildren if at_root => match pooled_rate {
                    Some(rate) => provider.root_child_contribution(tree, &branch, rate),
                    None => provider.contribution(tree, &branch),
                },
                _ => provider.contribution(tree, &branch),
            }
        }
    };

    // Second-parent edges ending below v.
    for i in 0..tree.child_count(v) {
        let c = tree.child(v, i);
        for k in 1..tree.parent_count(c) {
            if tree.parent_at(c, k) == Some(v) {
                let length = tree.height(v) - tree.height(c);
                if length < 0.0 {
                    return f64::NEG_INFINITY;
                }
                own += provider.contribution(
                    tree,
                    &Branch {
                        node: c,
                        parent: Some(v),
                        length,
                        pooled: None,
                    },
                );
            }
        }
    }
    own
}

// The first root child's branch with the second one's folded in.
fn pooled_root_branch(tree: &dyn TreeView, root: NodeId, roots: &RootIds) -> Option<Branch> {
    let first = roots.first?;
    let top = tree.height(root);
    Some(Branch {
        node: first,
        parent: Some(root),
        length: top - tree.height(first),
        pooled: roots.second.map(|s| (s, top - tree.height(s))),
    })
}

impl<P: BranchContributionProvider + ?Sized> ModelLikelihood for IncrementalEvaluator<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn log_likelihood(&mut self, tree: &dyn TreeView) -> Result<f64> {
        self.ensure_capacity(tree);
        if let Some(value) = self.total.current() {
            return Ok(value);
        }
        if *self.structure.get() == Structure::Unchecked {
            let checked = self.check_structure(tree);
            self.structure.set(checked);
        }
        let value = match *self.structure.get() {
            Structure::Infeasible => f64::NEG_INFINITY,
            _ => self.evaluate(tree)?,
        };
        if value == f64::NEG_INFINITY {
            self.stats.rejections += 1;
        }
        self.total.set(CachedScalar::known(value));
        Ok(value)
    }

    fn handle_tree_change(&mut self, tree: &dyn TreeView, change: &TreeChange) {
        self.ensure_capacity(tree);
        match change {
            // A moved node or changed rate affects its own branch and every
            // branch hanging from it.
            TreeChange::NodeChanged(v) | TreeChange::RateChanged(v) => {
                self.mark_with_children(tree, *v);
            }
            TreeChange::NodesChanged(nodes) => {
                for &v in nodes {
                    self.mark_with_children(tree, v);
                }
            }
            TreeChange::AllRatesChanged => self.dirty.mark_all(&mut self.cache),
            TreeChange::TopologyChanged => {
                debug!(model = %self.name, "topology changed, invalidating all nodes");
                self.dirty.mark_all(&mut self.cache);
                self.structure.set(Structure::Unchecked);
            }
        }
        if change.alters_tree() {
            self.intervals.invalidate();
        }
        self.total.invalidate();
    }

    fn store_state(&mut self) -> Result<()> {
        self.checkpoint.store()?;
        self.cache.begin();
        self.total.begin();
        self.roots.begin();
        self.structure.begin();
        self.intervals.begin();
        Ok(())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.checkpoint.restore()?;
        self.cache.rollback();
        self.total.rollback();
        self.roots.rollback();
        self.structure.rollback();
        self.intervals.rollback();
        Ok(())
    }

    fn accept_state(&mut self) -> Result<()> {
        self.checkpoint.accept()?;
        self.cache.commit();
        self.total.commit();
        self.roots.commit();
        self.structure.commit();
        self.intervals.commit();
        Ok(())
    }

    fn make_dirty(&mut self) {
        self.dirty.mark_all(&mut self.cache);
        self.structure.set(Structure::Unchecked);
        self.intervals.invalidate();
        self.total.invalidate();
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::tree::TimeTree;
    use proptest::prelude::*;

    struct Lengths;

    impl BranchContributionProvider for Lengths {
        fn contribution(&self, _tree: &dyn TreeView, branch: &Branch) -> f64 {
            -branch.total_length() * (1.0 + branch.node as f64 * 0.01)
        }
    }

    fn evaluator() -> IncrementalEvaluator<Lengths> {
        IncrementalEvaluator::new(Box::new(Lengths), EngineConfig::default()).unwrap()
    }

    proptest! {
        #[test]
        fn incremental_matches_full_recompute(
            moves in prop::collection::vec((0usize..31, 0.0f64..5.0, any::<bool>()), 1..40)
        ) {
            let mut tree = TimeTree::balanced(4, 1.0);
            let mut eval = evaluator();
            eval.log_likelihood(&tree).unwrap();

            for (node, height, accept) in moves {
                let old = tree.height(node);
                eval.store_state().unwrap();
                tree.set_height(node, height).unwrap();
                eval.handle_tree_change(&tree, &TreeChange::NodeChanged(node));
                let incremental = eval.log_likelihood(&tree).unwrap();
                let full = evaluator().log_likelihood(&tree).unwrap();
                prop_assert_eq!(incremental.to_bits(), full.to_bits());

                if accept {
                    eval.accept_state().unwrap();
                } else {
                    tree.set_height(node, old).unwrap();
                    eval.restore_state().unwrap();
                    let restored = eval.log_likelihood(&tree).unwrap();
                    let full = evaluator().log_likelihood(&tree).unwrap();
                    prop_assert_eq!(restored.to_bits(), full.to_bits());
                }
            }
        }
    }
}
