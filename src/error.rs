//! Error types for the subgraph-pcg library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::core::Key;
use thiserror::Error;

/// Main result type used throughout the subgraph-pcg library
pub type PcgResult<T> = Result<T, PcgError>;

/// Main error type for the subgraph-pcg library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PcgError {
    /// The variable graph has more than one connected component, so no
    /// spanning tree can cover every variable
    #[error("Disconnected graph: spanning tree covers {components} separate components")]
    DisconnectedGraph { components: usize },

    /// Singular or non-square triangular factor, or a variable left free by elimination
    #[error("Degenerate system: {0}")]
    DegenerateSystem(String),

    /// A conjugate gradient step failed to decrease the objective
    #[error("Non-descent step at iteration {iteration}: {detail}")]
    NonDescentStep { iteration: usize, detail: String },

    /// Rejected solver configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Block or sequence sizes that do not agree
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A key referenced by a factor or ordering has no value
    #[error("Missing variable {0}")]
    MissingVariable(Key),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PcgError {
    pub(crate) fn dimension_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        PcgError::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}
