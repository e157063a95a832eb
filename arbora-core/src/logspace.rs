//! Log-space arithmetic for numerically stable computation.
//!
//! [`LogValue`] stores a non-negative quantity as its natural logarithm. It is
//! used for probabilities as well as for very large combinatorial counts, so
//! unlike a probability type it is not bounded above by zero.

use core::f64::consts::PI;

/// A non-negative quantity stored as its natural logarithm: `ln(x)`.
///
/// Negative infinity represents zero.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogValue(pub f64);

impl LogValue {
    /// Wrap a raw non-negative value. `0.0` maps to [`LogValue::zero`].
    pub fn from_value(x: f64) -> Self {
        Self(x.ln())
    }

    /// Convert back to linear space. Overflows to `inf` for large values.
    pub fn to_value(self) -> f64 {
        self.0.exp()
    }

    /// Log-sum-exp: `ln(exp(self) + exp(other))` without overflow.
    pub fn ln_add(self, other: Self) -> Self {
        if self.0 == f64::NEG_INFINITY {
            return other;
        }
        if other.0 == f64::NEG_INFINITY {
            return self;
        }
        let (max, min) = if self.0 >= other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        Self(max + (min - max).exp().ln_1p())
    }

    /// Multiply in log-space (addition of log values).
    pub fn ln_mul(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }

    /// `ln(0) = -∞`.
    pub const fn zero() -> Self {
        Self(f64::NEG_INFINITY)
    }

    /// True when the represented value is exactly zero.
    pub fn is_zero(self) -> bool {
        self.0 == f64::NEG_INFINITY
    }
}

/// Sum a sequence of log values without leaving log space.
pub fn ln_sum<I: IntoIterator<Item = LogValue>>(values: I) -> LogValue {
    values
        .into_iter()
        .fold(LogValue::zero(), |acc, v| acc.ln_add(v))
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection: Γ(x) = π / (sin(πx) · Γ(1-x))
        let log_pi_over_sin = (PI / (PI * x).sin()).ln();
        log_pi_over_sin - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// `k choose 2` as a float, the pairwise coalescence multiplier.
pub fn choose2(k: u32) -> f64 {
    let k = k as f64;
    k * (k - 1.0) / 2.0
}

/// `ln(k choose 2)`; `-∞` for `k < 2`.
pub fn ln_choose2(k: u32) -> f64 {
    if k < 2 {
        return f64::NEG_INFINITY;
    }
    choose2(k).ln()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ln_add_is_commutative(a in -50.0f64..50.0, b in -50.0f64..50.0) {
            let x = LogValue(a).ln_add(LogValue(b));
            let y = LogValue(b).ln_add(LogValue(a));
            prop_assert!((x.0 - y.0).abs() < 1e-12);
        }

        #[test]
        fn ln_add_never_below_max(a in -50.0f64..50.0, b in -50.0f64..50.0) {
            let s = LogValue(a).ln_add(LogValue(b));
            prop_assert!(s.0 >= a.max(b));
        }
    }
}
