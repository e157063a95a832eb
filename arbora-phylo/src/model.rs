//! The interface every likelihood component presents to an MCMC driver.

use arbora_core::Result;

use crate::tree::{NodeId, TreeView};

/// A change the driver made to the tree or to per-node parameters.
///
/// Changes are reported before the next likelihood request. Restoring the
/// tree after a rejected move is not a change: `restore_state` already
/// brings the caches back.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeChange {
    /// The height of one node moved.
    NodeChanged(NodeId),
    /// The heights of several nodes moved.
    NodesChanged(Vec<NodeId>),
    /// A per-node parameter (such as a branch rate) changed.
    RateChanged(NodeId),
    /// A parameter shared by every branch changed.
    AllRatesChanged,
    /// Parent/child links changed.
    TopologyChanged,
}

impl TreeChange {
    /// True for changes that move node heights or links.
    pub fn alters_tree(&self) -> bool {
        !matches!(self, TreeChange::RateChanged(_) | TreeChange::AllRatesChanged)
    }
}

/// A checkpointable log-likelihood over a tree.
///
/// Per MCMC step the driver calls `store_state`, mutates and notifies,
/// requests `log_likelihood`, and then calls exactly one of `accept_state`
/// or `restore_state`. Calls out of that order fail with
/// `SequencingViolation`.
///
/// An infeasible state returns `Ok(f64::NEG_INFINITY)`. Errors are reserved
/// for anomalies.
pub trait ModelLikelihood: Send {
    /// Short label for logging.
    fn name(&self) -> &str;

    fn log_likelihood(&mut self, tree: &dyn TreeView) -> Result<f64>;

    fn handle_tree_change(&mut self, tree: &dyn TreeView, change: &TreeChange);

    fn store_state(&mut self) -> Result<()>;

    fn restore_state(&mut self) -> Result<()>;

    fn accept_state(&mut self) -> Result<()>;

    /// Discard every cached value.
    fn make_dirty(&mut self);
}
