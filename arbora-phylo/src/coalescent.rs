//! Coalescent likelihood over the interval decomposition.
//!
//! Each interval with `k` lineages contributes the probability that no
//! coalescence (and, with a recombination model, no recombination) happened
//! during it, times the density of the event at its upper boundary:
//!
//! ```text
//! coalescent:     -ln N(t) - C(k,2)·∫1/N - (k/2)·∫1/R
//! recombination:  -ln R(t) - C(k,2)·∫1/N - (k/2)·∫1/R
//! other:                   - C(k,2)·∫1/N - (k/2)·∫1/R
//! ```
//!
//! Multi-event boundaries are expanded into zero-length unit steps first.

use arbora_core::logspace::choose2;
use arbora_core::{ArboraError, Result};
use tracing::trace;

use crate::checkpoint::{CachedScalar, CheckpointManager, Checkpointed, Swappable};
use crate::config::IntervalConfig;
use crate::intervals::{IntervalList, IntervalType, TreeIntervals};
use crate::model::{ModelLikelihood, TreeChange};
use crate::tree::TreeView;

/// Population size through time, measured backwards from the present.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DemographicModel {
    Constant { pop_size: f64 },
    /// `N(t) = pop_size · exp(-growth_rate · t)`.
    Exponential { pop_size: f64, growth_rate: f64 },
}

impl DemographicModel {
    /// `N(t)`.
    pub fn demographic(&self, t: f64) -> f64 {
        match *self {
            DemographicModel::Constant { pop_size } => pop_size,
            DemographicModel::Exponential {
                pop_size,
                growth_rate,
            } => pop_size * (-growth_rate * t).exp(),
        }
    }

    /// `ln N(t)`, without under- or overflow in the exponential case.
    pub fn log_demographic(&self, t: f64) -> f64 {
        match *self {
            DemographicModel::Constant { pop_size } => pop_size.ln(),
            DemographicModel::Exponential {
                pop_size,
                growth_rate,
            } => pop_size.ln() - growth_rate * t,
        }
    }

    /// `∫_{t0}^{t1} 1/N(x) dx`.
    pub fn integral(&self, t0: f64, t1: f64) -> f64 {
        match *self {
            DemographicModel::Constant { pop_size } => (t1 - t0) / pop_size,
            DemographicModel::Exponential {
                pop_size,
                growth_rate,
            } => {
                if growth_rate == 0.0 {
                    (t1 - t0) / pop_size
                } else {
                    ((growth_rate * t1).exp() - (growth_rate * t0).exp()) / (pop_size * growth_rate)
                }
            }
        }
    }

    /// Positive, finite population size and finite growth.
    pub fn is_valid(&self) -> bool {
        match *self {
            DemographicModel::Constant { pop_size } => pop_size.is_finite() && pop_size > 0.0,
            DemographicModel::Exponential {
                pop_size,
                growth_rate,
            } => pop_size.is_finite() && pop_size > 0.0 && growth_rate.is_finite(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Demography {
    coalescent: Option<DemographicModel>,
    recombination: Option<DemographicModel>,
}

/// Log-likelihood of `list` under the given models.
///
/// Without a coalescent model the population size is integrated out:
/// `-(n-1) ln λ` with `λ = Σ length · lineages / 2`.
pub fn interval_log_likelihood(
    list: &IntervalList,
    coalescent: Option<&DemographicModel>,
    recombination: Option<&DemographicModel>,
) -> f64 {
    let Some(coalescent) = coalescent else {
        return analytical_log_likelihood(list);
    };
    if !coalescent.is_valid() || recombination.is_some_and(|r| !r.is_valid()) {
        return f64::NEG_INFINITY;
    }

    let mut log_l = 0.0;
    let mut t = list.start_time();
    for iv in list.resolved() {
        let end = t + iv.length;
        let k = iv.lineage_count;
        log_l -= choose2(k) * coalescent.integral(t, end);
        if let Some(r) = recombination {
            log_l -= k as f64 / 2.0 * r.integral(t, end);
        }
        match iv.interval_type {
            IntervalType::Coalescent => log_l -= coalescent.log_demographic(end),
            IntervalType::Recombination => match recombination {
                Some(r) => log_l -= r.log_demographic(end),
                None => return f64::NEG_INFINITY,
            },
            IntervalType::Sample | IntervalType::Nothing => {}
        }
        t = end;
    }
    log_l
}

// A single lineage has nothing to coalesce; several lineages with no time
// between them are impossible.
fn analytical_log_likelihood(list: &IntervalList) -> f64 {
    let n = list.sample_count();
    if n <= 1 {
        return 0.0;
    }
    let lambda: f64 = list
        .iter()
        .map(|iv| iv.length * iv.lineage_count as f64)
        .sum::<f64>()
        / 2.0;
    if lambda <= 0.0 {
        return f64::NEG_INFINITY;
    }
    -(n as f64 - 1.0) * lambda.ln()
}

/// The coalescent (optionally with recombination) as a model likelihood.
#[derive(Debug, Clone)]
pub struct CoalescentLikelihood {
    intervals: TreeIntervals,
    demography: Swappable<Demography>,
    value: Swappable<CachedScalar>,
    checkpoint: CheckpointManager,
}

impl CoalescentLikelihood {
    pub fn new(config: IntervalConfig, coalescent: Option<DemographicModel>) -> Result<Self> {
        Ok(Self {
            intervals: TreeIntervals::new(config)?,
            demography: Swappable::new(Demography {
                coalescent,
                recombination: None,
            }),
            value: Swappable::new(CachedScalar::UNKNOWN),
            checkpoint: CheckpointManager::new(),
        })
    }

    /// Add a recombination model; `∫1/R` is the expected number of
    /// recombinations per pair of lineages.
    pub fn with_recombination(mut self, model: DemographicModel) -> Self {
        self.demography.make_mut().recombination = Some(model);
        self
    }

    pub fn coalescent_model(&self) -> Option<DemographicModel> {
        self.demography.get().coalescent
    }

    pub fn recombination_model(&self) -> Option<DemographicModel> {
        self.demography.get().recombination
    }

    /// Replace the coalescent model. Undone by `restore_state`.
    pub fn set_coalescent_model(&mut self, model: Option<DemographicModel>) {
        self.demography.make_mut().coalescent = model;
        self.value.invalidate();
    }

    /// Replace the recombination model. Undone by `restore_state`.
    pub fn set_recombination_model(&mut self, model: Option<DemographicModel>) {
        self.demography.make_mut().recombination = model;
        self.value.invalidate();
    }

    pub fn tree_intervals(&self) -> &TreeIntervals {
        &self.intervals
    }
}

impl ModelLikelihood for CoalescentLikelihood {
    fn name(&self) -> &str {
        "coalescent"
    }

    fn log_likelihood(&mut self, tree: &dyn TreeView) -> Result<f64> {
        if let Some(v) = self.value.current() {
            return Ok(v);
        }
        let demography = *self.demography.get();
        let list = self.intervals.intervals(tree)?;
        let value = interval_log_likelihood(
            list,
            demography.coalescent.as_ref(),
            demography.recombination.as_ref(),
        );
        if value.is_nan() {
            return Err(ArboraError::nan("coalescent log likelihood"));
        }
        trace!(value, intervals = list.interval_count(), "computed coalescent likelihood");
        self.value.set(CachedScalar::known(value));
        Ok(value)
    }

    fn handle_tree_change(&mut self, _tree: &dyn TreeView, change: &TreeChange) {
        if change.alters_tree() {
            self.intervals.invalidate();
            self.value.invalidate();
        }
    }

    fn store_state(&mut self) -> Result<()> {
        self.checkpoint.store()?;
        self.intervals.begin();
        self.demography.begin();
        self.value.begin();
        Ok(())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.checkpoint.restore()?;
        self.intervals.rollback();
        self.demography.rollback();
        self.value.rollback();
        Ok(())
    }

    fn accept_state(&mut self) -> Result<()> {
        self.checkpoint.accept()?;
        self.intervals.commit();
        self.demography.commit();
        self.value.commit();
        Ok(())
    }

    fn make_dirty(&mut self) {
        self.intervals.invalidate();
        self.value.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TimeTree;

    fn constant(pop_size: f64) -> DemographicModel {
        DemographicModel::Constant { pop_size }
    }

    fn cherry(height: f64) -> TimeTree {
        let mut tree = TimeTree::new(height);
        tree.add_child(0, Some("A".into()), 0.0).unwrap();
        tree.add_child(0, Some("B".into()), 0.0).unwrap();
        tree
    }

    fn likelihood(model: Option<DemographicModel>) -> CoalescentLikelihood {
        CoalescentLikelihood::new(IntervalConfig::default(), model).unwrap()
    }

    #[test]
    fn two_samples_constant_size() {
        let mut coal = likelihood(Some(constant(2.0)));
        let value = coal.log_likelihood(&cherry(1.5)).unwrap();
        assert!((value - (-(2f64.ln()) - 1.5 / 2.0)).abs() < 1e-12);
    }

    #[test]
    fn polytomy_expands_to_zero_length_steps() {
        // ((A,B)@1, C, D)@2
        let mut tree = TimeTree::new(2.0);
        let ab = tree.add_child(0, None, 1.0).unwrap();
        tree.add_child(ab, None, 0.0).unwrap();
        tree.add_child(ab, None, 0.0).unwrap();
        tree.add_child(0, None, 0.0).unwrap();
        tree.add_child(0, None, 0.0).unwrap();

        let n = 3.0f64;
        let mut coal = likelihood(Some(constant(n)));
        let value = coal.log_likelihood(&tree).unwrap();
        // 4 lineages for 1, 3 lineages for 1, then a zero-length step at 2.
        let expected = -3.0 * n.ln() - 6.0 / n - 3.0 / n;
        assert!((value - expected).abs() < 1e-12);
    }

    #[test]
    fn serial_sample_interval_has_no_event_density() {
        // A@0, B@1, root@2: one lineage until 1, two until 2.
        let mut tree = TimeTree::new(2.0);
        tree.add_child(0, None, 0.0).unwrap();
        tree.add_child(0, None, 1.0).unwrap();
        let mut coal = likelihood(Some(constant(1.0)));
        assert!((coal.log_likelihood(&tree).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn exponential_integral() {
        let flat = DemographicModel::Exponential {
            pop_size: 2.0,
            growth_rate: 0.0,
        };
        assert_eq!(flat.integral(0.5, 2.5), constant(2.0).integral(0.5, 2.5));

        let growth = DemographicModel::Exponential {
            pop_size: 2.0,
            growth_rate: 0.3,
        };
        // Midpoint rule against the closed form.
        let steps = 100_000;
        let h = 2.0 / steps as f64;
        let numeric: f64 = (0..steps)
            .map(|i| h / growth.demographic(0.5 + (i as f64 + 0.5) * h))
            .sum();
        assert!((growth.integral(0.5, 2.5) - numeric).abs() < 1e-8);
        assert!((growth.log_demographic(1.0) - growth.demographic(1.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn recombination_intervals() {
        // A recombines at 0.5; one side joins B at 1, the other meets it at 2.
        let mut tree = TimeTree::new(2.0);
        let p1 = tree.add_child(0, None, 1.0).unwrap();
        let r = tree.add_child(p1, None, 0.5).unwrap();
        tree.add_child(p1, Some("B".into()), 0.0).unwrap();
        tree.add_child(r, Some("A".into()), 0.0).unwrap();
        tree.add_second_parent(r, 0).unwrap();

        let mut without = likelihood(Some(constant(1.0)));
        assert_eq!(without.log_likelihood(&tree).unwrap(), f64::NEG_INFINITY);

        let mut with = likelihood(Some(constant(1.0))).with_recombination(constant(2.0));
        let expected = -(2f64.ln()) - 0.25 - 0.5 // recombination, 2 lineages for 0.5
            - 1.5 - 0.375 // coalescence, 3 lineages for 0.5
            - 1.0 - 0.5; // coalescence, 2 lineages for 1
        assert!((with.log_likelihood(&tree).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn analytical_form_without_demography() {
        // Four tips at 0, cherries at 1, root at 2: λ = (4 + 2) / 2.
        let tree = TimeTree::balanced(2, 1.0);
        let mut coal = likelihood(None);
        assert!((coal.log_likelihood(&tree).unwrap() + 3.0 * 3f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn analytical_form_degenerate_trees() {
        let mut coal = likelihood(None);
        assert_eq!(coal.log_likelihood(&TimeTree::new(0.0)).unwrap(), 0.0);

        let mut coal = likelihood(None);
        assert_eq!(coal.log_likelihood(&cherry(0.0)).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn invalid_population_is_a_rejection() {
        let mut coal = likelihood(Some(constant(-1.0)));
        assert_eq!(coal.log_likelihood(&cherry(1.0)).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn model_change_is_undone_by_restore() {
        let tree = cherry(1.0);
        let mut coal = likelihood(Some(constant(1.0)));
        let before = coal.log_likelihood(&tree).unwrap();

        coal.store_state().unwrap();
        coal.set_coalescent_model(Some(constant(5.0)));
        let proposed = coal.log_likelihood(&tree).unwrap();
        assert!(proposed != before);
        coal.restore_state().unwrap();

        assert_eq!(coal.coalescent_model(), Some(constant(1.0)));
        assert_eq!(coal.log_likelihood(&tree).unwrap().to_bits(), before.to_bits());
    }

    #[test]
    fn height_change_rebuilds_intervals() {
        let mut tree = cherry(1.0);
        let mut coal = likelihood(Some(constant(1.0)));
        coal.log_likelihood(&tree).unwrap();

        coal.store_state().unwrap();
        tree.set_height(0, 3.0).unwrap();
        coal.handle_tree_change(&tree, &TreeChange::NodeChanged(0));
        assert!((coal.log_likelihood(&tree).unwrap() + 3.0).abs() < 1e-12);
        coal.accept_state().unwrap();
        assert_eq!(coal.tree_intervals().rebuild_count(), 2);

        coal.handle_tree_change(&tree, &TreeChange::AllRatesChanged);
        coal.log_likelihood(&tree).unwrap();
        assert_eq!(coal.tree_intervals().rebuild_count(), 2);
    }
}
