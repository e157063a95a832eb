//! Structured error types for the arbora engine.
//!
//! Only anomalies are errors. An infeasible parameter combination is an
//! ordinary MCMC rejection and is reported as a `-inf` log-likelihood, never
//! through this type.

use thiserror::Error;

/// Unified error type for all arbora operations.
#[derive(Debug, Error)]
pub enum ArboraError {
    /// A structural invariant of the tree or graph is violated
    /// (lineage count reaching zero early, a missing root child, ...).
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A computation produced NaN.
    #[error("numerical anomaly at node {node:?}: {context}")]
    NumericalAnomaly {
        /// Node whose contribution was NaN, if the anomaly is node-local.
        node: Option<usize>,
        /// What was being computed.
        context: String,
    },

    /// `store_state` / `restore_state` / `accept_state` called out of order.
    #[error("sequencing violation: {operation} called while {phase}")]
    SequencingViolation {
        /// The operation that was attempted.
        operation: &'static str,
        /// The checkpoint phase at the time of the call.
        phase: &'static str,
    },

    /// Invalid input (bad arguments, out-of-range values, bad configuration)
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ArboraError {
    /// Create an invalid topology error.
    pub fn topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology(message.into())
    }

    /// Create a NaN error for a node-local computation.
    pub fn nan_at(node: usize, context: impl Into<String>) -> Self {
        Self::NumericalAnomaly {
            node: Some(node),
            context: context.into(),
        }
    }

    /// Create a NaN error for an aggregate computation.
    pub fn nan(context: impl Into<String>) -> Self {
        Self::NumericalAnomaly {
            node: None,
            context: context.into(),
        }
    }
}

/// Convenience alias used throughout arbora.
pub type Result<T> = std::result::Result<T, ArboraError>;
