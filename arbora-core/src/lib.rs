//! Shared primitives for the arbora likelihood engine.
//!
//! `arbora-core` provides the foundation the other arbora crates build on:
//!
//! - **Error types** — [`ArboraError`] and [`Result`] for structured error handling
//! - **Log-space arithmetic** — [`LogValue`] and special functions for
//!   probabilities and large combinatorial counts
//! - **Traits** — small shared abstractions like [`Summarizable`]

pub mod error;
pub mod logspace;
pub mod traits;

pub use error::{ArboraError, Result};
pub use logspace::LogValue;
pub use traits::*;
