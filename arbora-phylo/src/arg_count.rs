//! Counting ancestral recombination graph topologies.
//!
//! `C(k, r)` is the number of distinct ranked ARG histories that start with
//! `k` lineages and end in a single ancestor after exactly `r`
//! recombinations. Going back in time, the next event is either a
//! coalescence of one of the `k(k-1)/2` pairs or a recombination of one of
//! the `k` lineages:
//!
//! ```text
//! C(1, 0) = 1,  C(1, r) = 0 for r > 0
//! C(k, r) = k(k-1)/2 · C(k-1, r) + k · C(k+1, r-1)
//! ```
//!
//! Counts grow super-exponentially, so they are kept as natural logarithms
//! and added with log-sum-exp.

use std::collections::HashMap;

use arbora_core::logspace::{ln_choose2, ln_sum, LogValue};
use arbora_core::{ArboraError, Result};
use tracing::debug;

/// Memoised `ln C(taxa, recombinations)`.
#[derive(Debug, Clone, Default)]
pub struct ArgCounter {
    table: HashMap<(u32, u32), f64>,
}

impl ArgCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of memoised `(lineages, recombinations)` entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// `ln C(taxa, recombinations)`, computing and memoising as needed.
    ///
    /// `-inf` means no such graph exists (one taxon with recombinations).
    pub fn log_count(&mut self, taxa: u32, recombinations: u32) -> Result<f64> {
        if taxa == 0 {
            return Err(ArboraError::InvalidInput(
                "ARG count needs at least one taxon".into(),
            ));
        }
        if let Some(&v) = self.table.get(&(taxa, recombinations)) {
            return Ok(v);
        }
        let before = self.table.len();
        let value = self.fill(taxa, recombinations);
        debug!(
            taxa,
            recombinations,
            new_entries = self.table.len() - before,
            "extended ARG count table"
        );
        Ok(value)
    }

    /// Lookup without computing.
    pub fn cached(&self, taxa: u32, recombinations: u32) -> Option<f64> {
        self.table.get(&(taxa, recombinations)).copied()
    }

    /// Fill every entry needed for up to `max_taxa` taxa and
    /// `max_recombinations` recombinations, so that later lookups in that
    /// range never recurse.
    pub fn precompute(&mut self, max_taxa: u32, max_recombinations: u32) -> Result<()> {
        if max_taxa == 0 {
            return Err(ArboraError::InvalidInput(
                "ARG count needs at least one taxon".into(),
            ));
        }
        let before = self.table.len();
        // C(k, r) reads C(k-1, r) and C(k+1, r-1): r ascending, then k
        // ascending, with the k range shrinking as r grows.
        for r in 0..=max_recombinations {
            let top = max_taxa + (max_recombinations - r);
            for k in 1..=top {
                self.fill(k, r);
            }
        }
        debug!(
            max_taxa,
            max_recombinations,
            entries = self.table.len(),
            new_entries = self.table.len() - before,
            "precomputed ARG count table"
        );
        Ok(())
    }

    // Recurses on C(k-1, r) first; with the table filled bottom-up the
    // recursion depth stays at one.
    fn fill(&mut self, k: u32, r: u32) -> f64 {
        if let Some(&v) = self.table.get(&(k, r)) {
            return v;
        }
        let value = if r == 0 {
            log_coalescent_histories(k)
        } else if k == 1 {
            f64::NEG_INFINITY
        } else {
            let coalesce = LogValue(ln_choose2(k)).ln_mul(LogValue(self.fill(k - 1, r)));
            let recombine =
                LogValue::from_value(k as f64).ln_mul(LogValue(self.fill(k + 1, r - 1)));
            ln_sum([coalesce, recombine]).0
        };
        self.table.insert((k, r), value);
        value
    }
}

/// `ln Π_{i=3..=n} C(i, 2)`: ranked coalescent histories without
/// recombination.
fn log_coalescent_histories(n: u32) -> f64 {
    (3..=n).map(ln_choose2).sum()
}
