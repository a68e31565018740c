//! Subgraph-preconditioned conjugate gradient for sparse least squares.
//!
//! A linear factor graph `A·x = b`, as produced by linearizing a SLAM or
//! pose-graph problem, is split into a spanning tree `A1` and the
//! loop-closing remainder `A2`. The tree is solved exactly by elimination and
//! then serves as a preconditioner for conjugate gradients on the full
//! system.
//!
//! # Example
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use subgraph_pcg::{GaussianFactorGraph, JacobianFactor, SubgraphPcg};
//!
//! let one = DMatrix::from_element(1, 1, 1.0);
//! let graph = GaussianFactorGraph::from_factors(vec![
//!     JacobianFactor::unary(0, one.clone(), DVector::from_element(1, 0.0)).unwrap(),
//!     JacobianFactor::binary(0, -&one, 1, one.clone(), DVector::from_element(1, 1.0)).unwrap(),
//!     JacobianFactor::binary(1, -&one, 2, one.clone(), DVector::from_element(1, 1.0)).unwrap(),
//!     JacobianFactor::binary(0, -&one, 2, one.clone(), DVector::from_element(1, 2.3)).unwrap(),
//! ]);
//!
//! let report = SubgraphPcg::new().solve(&graph).unwrap();
//! assert!(report.solution.cg.status.is_converged());
//! ```

pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod optimizer;

pub use crate::core::{Errors, GaussianFactorGraph, JacobianFactor, Key, Ordering, VectorConfig};
pub use error::{PcgError, PcgResult};
pub use linalg::{
    GaussianBayesNet, GaussianConditional, SpanningTreeKind, Subgraph, SubgraphBuilder,
    SubgraphBuilderConfig, SubgraphPreconditioner, SubgraphWeight, VectorSpace,
};
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    CgDirection, CgResult, CgStatus, ConjugateGradient, DenseLeastSquares, LeastSquaresSystem,
    NonlinearSystem, PcgConfig, SolveReport, SolverState, SubgraphPcg, SubgraphSolution,
};
