//! Core data model for linear factor graphs
//!
//! This module contains the building blocks shared by elimination, the
//! preconditioner and the solvers:
//! - Variable keys and elimination orderings
//! - Keyed variable blocks (`VectorConfig`) and per-factor residuals (`Errors`)
//! - Jacobian factors and the linear factor graph they form

pub mod errors;
pub mod factors;
pub mod graph;
pub mod ordering;
pub mod vector_config;

pub use errors::Errors;
pub use factors::JacobianFactor;
pub use graph::{GaussianFactorGraph, GraphStatistics};
pub use ordering::Ordering;
pub use vector_config::VectorConfig;

/// Identifier of a variable
pub type Key = usize;
