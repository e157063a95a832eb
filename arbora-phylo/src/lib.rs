//! Incremental, checkpointed tree-likelihood evaluation for MCMC phylogenetics.
//!
//! An MCMC driver proposes small changes to a time tree (or recombination
//! graph) thousands of times per second. This crate keeps every likelihood
//! component cheap to re-evaluate after such a change and cheap to roll back
//! when the proposal is rejected:
//!
//! - **Interval decomposition** — [`IntervalBuilder`] cuts the tree into
//!   coalescent / sample / recombination intervals
//! - **Dirty tracking** — [`DirtyPropagator`] marks changed nodes and their
//!   ancestors
//! - **Incremental evaluation** — [`IncrementalEvaluator`] recomputes only the
//!   dirty branch contributions supplied by a [`BranchContributionProvider`]
//! - **Checkpointing** — double-buffered caches behind a
//!   [`CheckpointManager`] give O(changed) store / restore / accept
//! - **ARG counting** — [`ArgCounter`] gives log counts of recombination graph
//!   topologies for [`UniformArgPrior`]
//! - **Models** — [`CoalescentLikelihood`], Poisson and rate-change providers,
//!   and [`PartitionedLikelihood`] to add components together
//!
//! Infeasible states score `f64::NEG_INFINITY`; errors are reserved for
//! anomalies such as NaN contributions or out-of-order checkpoint calls.

pub mod arg_count;
pub mod arg_prior;
pub mod checkpoint;
pub mod coalescent;
pub mod config;
pub mod dirty;
pub mod evaluator;
pub mod intervals;
pub mod model;
pub mod partition;
pub mod providers;
pub mod tree;

pub use arbora_core::{ArboraError, Result};
pub use arg_count::ArgCounter;
pub use arg_prior::UniformArgPrior;
pub use checkpoint::{CheckpointManager, Checkpointed, DoubleBuffer, Phase, Swappable};
pub use coalescent::{CoalescentLikelihood, DemographicModel};
pub use config::{EngineConfig, IntervalConfig, RootPolicy};
pub use dirty::{DirtyPropagator, EvaluationCache};
pub use evaluator::{Branch, BranchContributionProvider, EvaluationStats, IncrementalEvaluator};
pub use intervals::{Interval, IntervalBuilder, IntervalList, IntervalType, TreeIntervals};
pub use model::{ModelLikelihood, TreeChange};
pub use partition::PartitionedLikelihood;
pub use providers::{FnProvider, PoissonMutationProvider, RateChangeDensity, RateChangeProvider};
pub use tree::{NodeId, TimeTree, TreeView};
