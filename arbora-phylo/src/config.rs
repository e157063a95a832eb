//! Engine configuration.
//!
//! Everything here is plain data with a `Default` and a `validate` step, so
//! it can come from code or (with the `serde` feature) from a config file.

use arbora_core::{ArboraError, Result};

use crate::tree::NodeId;

/// Default tolerance for merging near-coincident event heights.
pub const DEFAULT_MULTIFURCATION_EPSILON: f64 = 1e-9;

/// How the root and its children are scored.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RootPolicy {
    /// The root contributes nothing. Its first two children form a single
    /// pooled branch scored at the first child; the second child contributes
    /// nothing.
    #[default]
    IgnoreRoot,
    /// The root rate is the mean of its children's rates. The root
    /// contributes nothing and each child is scored against that mean.
    PoolChildren,
    /// The root is scored against a fixed external root rate and its
    /// children are scored as ordinary branches.
    Normal { root_rate: f64 },
}

/// Which part of the tree the interval decomposition covers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IntervalConfig {
    /// Events closer than this are merged into one multifurcation.
    pub multifurcation_epsilon: f64,
    /// Root of the included subtree. `None` means the whole tree.
    pub included_root: Option<NodeId>,
    /// Roots of subtrees that are collapsed to a single sampled lineage.
    pub excluded_subtrees: Vec<NodeId>,
    /// Times at which an empty `Nothing` boundary is inserted, for piecewise
    /// demographic models.
    pub change_points: Vec<f64>,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            multifurcation_epsilon: DEFAULT_MULTIFURCATION_EPSILON,
            included_root: None,
            excluded_subtrees: Vec::new(),
            change_points: Vec::new(),
        }
    }
}

impl IntervalConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.multifurcation_epsilon.is_finite() || self.multifurcation_epsilon < 0.0 {
            return Err(ArboraError::InvalidInput(format!(
                "multifurcation epsilon must be finite and non-negative, got {}",
                self.multifurcation_epsilon
            )));
        }
        if let Some(t) = self.change_points.iter().find(|t| !t.is_finite()) {
            return Err(ArboraError::InvalidInput(format!(
                "change point must be finite, got {t}"
            )));
        }
        if let Some(root) = self.included_root {
            if self.excluded_subtrees.contains(&root) {
                return Err(ArboraError::InvalidInput(format!(
                    "node {root} is both the included root and an excluded subtree"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of an incremental branch evaluator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    pub root_policy: RootPolicy,
    /// Graphs with more recombination nodes than this score `-inf`.
    pub max_recombinations: Option<usize>,
    /// Reject graphs where some node is unreachable from the root or lies
    /// above its parent. Checked only after a topology change.
    pub check_reachability: bool,
    pub intervals: IntervalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_policy: RootPolicy::default(),
            max_recombinations: None,
            check_reachability: true,
            intervals: IntervalConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_root_policy(mut self, policy: RootPolicy) -> Self {
        self.root_policy = policy;
        self
    }

    pub fn with_max_recombinations(mut self, max: usize) -> Self {
        self.max_recombinations = Some(max);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let RootPolicy::Normal { root_rate } = self.root_policy {
            if !root_rate.is_finite() {
                return Err(ArboraError::InvalidInput(format!(
                    "root rate must be finite, got {root_rate}"
                )));
            }
        }
        self.intervals.validate()
    }
}
