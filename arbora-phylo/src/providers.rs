//! Concrete branch contribution models.
//!
//! - [`PoissonMutationProvider`]: observed mutation counts per branch against
//!   a Poisson with mean `length × rate × sequence_length`.
//! - [`RateChangeProvider`]: autocorrelated rates, each child rate drawn
//!   around its parent's rate with variance growing with branch length.
//! - [`FnProvider`]: wraps a closure.

use std::f64::consts::PI;
use std::fmt;

use arbora_core::logspace::ln_gamma;
use arbora_core::{ArboraError, Result};

use crate::evaluator::{Branch, BranchContributionProvider};
use crate::tree::{NodeId, TreeView};

/// A provider backed by a closure.
pub struct FnProvider<F> {
    f: F,
}

impl<F> FnProvider<F>
where
    F: Fn(&dyn TreeView, &Branch) -> f64 + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProvider")
    }
}

impl<F> BranchContributionProvider for FnProvider<F>
where
    F: Fn(&dyn TreeView, &Branch) -> f64 + Send + Sync,
{
    fn contribution(&self, tree: &dyn TreeView, branch: &Branch) -> f64 {
        (self.f)(tree, branch)
    }
}

// ---------------------------------------------------------------------------
// Poisson
// ---------------------------------------------------------------------------

/// `ln(n!) - [(n + 1/2) ln n - n + ln(2π)/2]`, the error of Stirling's
/// approximation.
fn stirling_error(n: f64) -> f64 {
    const S0: f64 = 1.0 / 12.0;
    const S1: f64 = 1.0 / 360.0;
    const S2: f64 = 1.0 / 1260.0;
    const S3: f64 = 1.0 / 1680.0;
    const S4: f64 = 1.0 / 1188.0;

    if n < 15.0 {
        return ln_gamma(n + 1.0) - (n + 0.5) * n.ln() + n - 0.5 * (2.0 * PI).ln();
    }
    let nn = n * n;
    if n > 500.0 {
        return (S0 - S1 / nn) / n;
    }
    if n > 80.0 {
        return (S0 - (S1 - S2 / nn) / nn) / n;
    }
    if n > 35.0 {
        return (S0 - (S1 - (S2 - S3 / nn) / nn) / nn) / n;
    }
    (S0 - (S1 - (S2 - (S3 - S4 / nn) / nn) / nn) / nn) / n
}

/// Deviance term `x ln(x/μ) + μ - x`, evaluated by series near `x = μ`.
fn deviance(x: f64, mu: f64) -> f64 {
    if (x - mu).abs() < 0.1 * (x + mu) {
        let v = (x - mu) / (x + mu);
        let mut s = (x - mu) * v;
        let mut ej = 2.0 * x * v;
        let v2 = v * v;
        for j in 1..1000 {
            ej *= v2;
            let s1 = s + ej / (2 * j + 1) as f64;
            if s1 == s {
                return s1;
            }
            s = s1;
        }
        return s;
    }
    x * (x / mu).ln() + mu - x
}

/// Poisson log-probability of `x` events at rate `mean`, by the saddle-point
/// expansion. Accurate for large counts where `x ln(mean) - ln(x!)` cancels
/// badly.
pub fn log_poisson(mean: f64, x: u64) -> f64 {
    if mean < 0.0 || mean.is_nan() {
        return f64::NAN;
    }
    if mean == 0.0 {
        return if x == 0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if x == 0 {
        return -mean;
    }
    let x = x as f64;
    -stirling_error(x) - deviance(x, mean) - 0.5 * (2.0 * PI * x).ln()
}

/// Scores branches by the number of mutations observed along them.
#[derive(Debug, Clone)]
pub struct PoissonMutationProvider {
    mutations: Vec<u64>,
    rates: Vec<f64>,
    sequence_length: f64,
}

impl PoissonMutationProvider {
    /// `mutations[v]` is the count observed on the branch above node `v`.
    /// All rates start at 1.
    pub fn new(mutations: Vec<u64>, sequence_length: f64) -> Result<Self> {
        if !(sequence_length.is_finite() && sequence_length > 0.0) {
            return Err(ArboraError::InvalidInput(format!(
                "sequence length must be positive, got {}",
                sequence_length
            )));
        }
        let rates = vec![1.0; mutations.len()];
        Ok(Self {
            mutations,
            rates,
            sequence_length,
        })
    }

    /// Counts from branch lengths in substitutions per site, rounded to
    /// whole mutations.
    pub fn from_substitution_lengths(lengths: &[f64], sequence_length: f64) -> Result<Self> {
        let mut mutations = Vec::with_capacity(lengths.len());
        for (node, &l) in lengths.iter().enumerate() {
            if !(l.is_finite() && l >= 0.0) {
                return Err(ArboraError::InvalidInput(format!(
                    "substitution length of node {} must be non-negative, got {}",
                    node, l
                )));
            }
            mutations.push((l * sequence_length).round() as u64);
        }
        Self::new(mutations, sequence_length)
    }

    pub fn with_rates(mut self, rates: Vec<f64>) -> Result<Self> {
        if rates.len() != self.mutations.len() {
            return Err(ArboraError::InvalidInput(format!(
                "{} rates for {} nodes",
                rates.len(),
                self.mutations.len()
            )));
        }
        self.rates = rates;
        Ok(self)
    }

    pub fn mutations(&self, node: NodeId) -> Option<u64> {
        self.mutations.get(node).copied()
    }

    pub fn set_rate(&mut self, node: NodeId, rate: f64) {
        self.rates[node] = rate;
    }

    /// Set every branch to the same rate.
    pub fn set_clock_rate(&mut self, rate: f64) {
        self.rates.iter_mut().for_each(|r| *r = rate);
    }

    fn expected(&self, node: NodeId, length: f64) -> f64 {
        self.rates.get(node).map_or(f64::NAN, |r| r * length)
    }
}

impl BranchContributionProvider for PoissonMutationProvider {
    fn contribution(&self, _tree: &dyn TreeView, branch: &Branch) -> f64 {
        let mut expected = self.expected(branch.node, branch.length);
        let mut observed = match self.mutations.get(branch.node) {
            Some(&x) => x,
            None => return f64::NAN,
        };
        if let Some((sibling, length)) = branch.pooled {
            expected += self.expected(sibling, length);
            observed += self.mutations.get(sibling).copied().unwrap_or(0);
        }
        log_poisson(expected * self.sequence_length, observed)
    }

    fn rate(&self, node: NodeId) -> Option<f64> {
        self.rates.get(node).copied()
    }
}

// ---------------------------------------------------------------------------
// Rate change
// ---------------------------------------------------------------------------

/// Distribution of a child rate given its parent's rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RateChangeDensity {
    Normal,
    /// Mean-preserving: `E[child] = parent`.
    Lognormal,
    /// Parameterised by mean and variance.
    InverseGaussian,
}

impl RateChangeDensity {
    /// Log density of `x` with the given mean and variance.
    ///
    /// With zero variance the distribution is a point mass at `mean`.
    pub fn log_density(self, x: f64, mean: f64, variance: f64) -> f64 {
        if variance <= 0.0 {
            return if x == mean { 0.0 } else { f64::NEG_INFINITY };
        }
        match self {
            RateChangeDensity::Normal => {
                -0.5 * (2.0 * PI * variance).ln() - (x - mean).powi(2) / (2.0 * variance)
            }
            RateChangeDensity::Lognormal => {
                if x <= 0.0 || mean <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let mu = mean.ln() - 0.5 * variance;
                -x.ln() - 0.5 * (2.0 * PI * variance).ln() - (x.ln() - mu).powi(2) / (2.0 * variance)
            }
            RateChangeDensity::InverseGaussian => {
                if x <= 0.0 || mean <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let shape = mean.powi(3) / variance;
                0.5 * (shape / (2.0 * PI * x.powi(3))).ln()
                    - shape * (x - mean).powi(2) / (2.0 * mean * mean * x)
            }
        }
    }
}

/// Autocorrelated branch rates.
///
/// The rate at each node is drawn around the rate at its parent with
/// variance `variance × branch_length`.
#[derive(Debug, Clone)]
pub struct RateChangeProvider {
    density: RateChangeDensity,
    variance: f64,
    rates: Vec<f64>,
}

impl RateChangeProvider {
    pub fn new(density: RateChangeDensity, variance: f64, rates: Vec<f64>) -> Result<Self> {
        if !(variance.is_finite() && variance > 0.0) {
            return Err(ArboraError::InvalidInput(format!(
                "rate change variance must be positive, got {}",
                variance
            )));
        }
        Ok(Self {
            density,
            variance,
            rates,
        })
    }

    pub fn density(&self) -> RateChangeDensity {
        self.density
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn set_rate(&mut self, node: NodeId, rate: f64) {
        self.rates[node] = rate;
    }

    /// Changing the variance affects every branch.
    pub fn set_variance(&mut self, variance: f64) {
        self.variance = variance;
    }

    fn rate_of(&self, node: NodeId) -> f64 {
        self.rates.get(node).copied().unwrap_or(f64::NAN)
    }
}

impl BranchContributionProvider for RateChangeProvider {
    fn contribution(&self, _tree: &dyn TreeView, branch: &Branch) -> f64 {
        let child = self.rate_of(branch.node);
        // A pooled root branch runs from one root child to the other.
        let mean = match (branch.pooled, branch.parent) {
            (Some((sibling, _)), _) => self.rate_of(sibling),
            (None, Some(parent)) => self.rate_of(parent),
            (None, None) => return 0.0,
        };
        self.density
            .log_density(child, mean, self.variance * branch.total_length())
    }

    fn rate(&self, node: NodeId) -> Option<f64> {
        self.rates.get(node).copied()
    }

    fn root_contribution(&self, _tree: &dyn TreeView, root: NodeId, root_rate: f64) -> f64 {
        self.density
            .log_density(self.rate_of(root), root_rate, self.variance)
    }

    fn root_child_contribution(&self, _tree: &dyn TreeView, branch: &Branch, root_rate: f64) -> f64 {
        self.density
            .log_density(self.rate_of(branch.node), root_rate, self.variance * branch.length)
    }
}
