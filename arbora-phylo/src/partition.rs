//! Sums of independent likelihood components over one tree.
//!
//! With the `parallel` feature the components are evaluated on the rayon
//! thread pool. Each component owns its caches, so no state is shared
//! between workers; the sum is taken in component order either way.

use arbora_core::{ArboraError, Result};

use crate::checkpoint::CheckpointManager;
use crate::model::{ModelLikelihood, TreeChange};
use crate::tree::TreeView;

/// A compound likelihood: the sum of its components.
pub struct PartitionedLikelihood {
    parts: Vec<Box<dyn ModelLikelihood>>,
    checkpoint: CheckpointManager,
}

impl std::fmt::Debug for PartitionedLikelihood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.parts.iter().map(|p| p.name()).collect();
        f.debug_struct("PartitionedLikelihood")
            .field("parts", &names)
            .field("phase", &self.checkpoint.phase())
            .finish()
    }
}

impl Default for PartitionedLikelihood {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionedLikelihood {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            checkpoint: CheckpointManager::new(),
        }
    }

    pub fn with_part(mut self, part: Box<dyn ModelLikelihood>) -> Self {
        self.parts.push(part);
        self
    }

    /// Add a component. Fails while a checkpoint is open.
    pub fn push(&mut self, part: Box<dyn ModelLikelihood>) -> Result<()> {
        if self.checkpoint.is_open() {
            return Err(ArboraError::InvalidInput(
                "cannot add a partition while a checkpoint is open".into(),
            ));
        }
        self.parts.push(part);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Each component's log-likelihood, in order.
    pub fn component_log_likelihoods(&mut self, tree: &dyn TreeView) -> Result<Vec<f64>> {
        #[cfg(feature = "parallel")]
        let values = {
            use rayon::prelude::*;
            self.parts
                .par_iter_mut()
                .map(|part| part.log_likelihood(tree))
                .collect::<Result<Vec<f64>>>()?
        };
        #[cfg(not(feature = "parallel"))]
        let values = self
            .parts
            .iter_mut()
            .map(|part| part.log_likelihood(tree))
            .collect::<Result<Vec<f64>>>()?;
        Ok(values)
    }
}

impl ModelLikelihood for PartitionedLikelihood {
    fn name(&self) -> &str {
        "partitioned"
    }

    fn log_likelihood(&mut self, tree: &dyn TreeView) -> Result<f64> {
        let total: f64 = self.component_log_likelihoods(tree)?.iter().sum();
        if total.is_nan() {
            return Err(ArboraError::nan("sum of partition log likelihoods"));
        }
        Ok(total)
    }

    fn handle_tree_change(&mut self, tree: &dyn TreeView, change: &TreeChange) {
        for part in &mut self.parts {
            part.handle_tree_change(tree, change);
        }
    }

    fn store_state(&mut self) -> Result<()> {
        self.checkpoint.store()?;
        self.parts.iter_mut().try_for_each(|p| p.store_state())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.checkpoint.restore()?;
        self.parts.iter_mut().try_for_each(|p| p.restore_state())
    }

    fn accept_state(&mut self) -> Result<()> {
        self.checkpoint.accept()?;
        self.parts.iter_mut().try_for_each(|p| p.accept_state())
    }

    fn make_dirty(&mut self) {
        for part in &mut self.parts {
            part.make_dirty();
        }
    }
}
