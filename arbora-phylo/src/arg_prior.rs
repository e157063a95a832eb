//! Uniform prior over ARG topologies.
//!
//! Every ranked history with the observed number of taxa and recombinations
//! is equally likely: the log prior is `-ln C(taxa, recombinations)`.

use arbora_core::{LogValue, Result};
use tracing::trace;

use crate::arg_count::ArgCounter;
use crate::checkpoint::{CachedScalar, CheckpointManager, Checkpointed, Swappable};
use crate::model::{ModelLikelihood, TreeChange};
use crate::tree::TreeView;

/// `-ln C(n, r)` for the current graph, cached until the topology changes.
#[derive(Debug, Clone)]
pub struct UniformArgPrior {
    counter: ArgCounter,
    max_recombinations: Option<usize>,
    value: Swappable<CachedScalar>,
    checkpoint: CheckpointManager,
}

impl UniformArgPrior {
    pub fn new(max_recombinations: Option<usize>) -> Self {
        Self {
            counter: ArgCounter::new(),
            max_recombinations,
            value: Swappable::new(CachedScalar::UNKNOWN),
            checkpoint: CheckpointManager::new(),
        }
    }

    /// A prior whose counts for up to `max_taxa` taxa are filled up front.
    pub fn with_precomputed(max_taxa: u32, max_recombinations: u32) -> Result<Self> {
        let mut prior = Self::new(Some(max_recombinations as usize));
        prior.counter.precompute(max_taxa, max_recombinations)?;
        Ok(prior)
    }

    pub fn counter(&self) -> &ArgCounter {
        &self.counter
    }
}

impl ModelLikelihood for UniformArgPrior {
    fn name(&self) -> &str {
        "uniform-arg-prior"
    }

    fn log_likelihood(&mut self, tree: &dyn TreeView) -> Result<f64> {
        if let Some(v) = self.value.current() {
            return Ok(v);
        }
        let taxa = tree.external_count();
        let recombinations = tree.recombination_count();
        let value = match self.max_recombinations {
            Some(max) if recombinations > max => {
                trace!(recombinations, max, "rejected: too many recombinations");
                f64::NEG_INFINITY
            }
            _ => {
                let log_count = self.counter.log_count(taxa as u32, recombinations as u32)?;
                if LogValue(log_count).is_zero() {
                    trace!(taxa, recombinations, "rejected: no such graph");
                    f64::NEG_INFINITY
                } else {
                    -log_count
                }
            }
        };
        self.value.set(CachedScalar::known(value));
        Ok(value)
    }

    fn handle_tree_change(&mut self, _tree: &dyn TreeView, change: &TreeChange) {
        // Heights and rates do not change the count.
        if *change == TreeChange::TopologyChanged {
            self.value.invalidate();
        }
    }

    fn store_state(&mut self) -> Result<()> {
        self.checkpoint.store()?;
        self.value.begin();
        Ok(())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.checkpoint.restore()?;
        self.value.rollback();
        Ok(())
    }

    fn accept_state(&mut self) -> Result<()> {
        self.checkpoint.accept()?;
        self.value.commit();
        Ok(())
    }

    fn make_dirty(&mut self) {
        self.value.invalidate();
    }
}
