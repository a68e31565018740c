//! Linear algebra for subgraph preconditioning.
//!
//! This module provides:
//! - Sequential QR elimination of a linear factor graph into a Bayes net
//! - Spanning-tree splitting of a graph into tree and loop-closing subgraphs
//! - The subgraph preconditioner exposing error, gradient and operator pair
//! - Sparse matrix export using faer
//! - The `VectorSpace` abstraction the conjugate gradient solver works on

use crate::error::{PcgError, PcgResult};

pub mod bayes_net;
pub mod elimination;
pub mod subgraph_builder;
pub mod subgraph_preconditioner;

pub use bayes_net::{GaussianBayesNet, GaussianConditional, PIVOT_TOLERANCE};
pub use subgraph_builder::{SpanningTreeKind, Subgraph, SubgraphBuilder, SubgraphBuilderConfig, SubgraphWeight};
pub use subgraph_preconditioner::SubgraphPreconditioner;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Inner-product space operations needed by Krylov solvers
///
/// Implemented by keyed variable blocks (`VectorConfig`), per-factor
/// residuals (`Errors`) and plain dense vectors. Binary operations fail when
/// the two operands do not share a layout.
pub trait VectorSpace: Clone {
    /// Inner product `⟨self, other⟩`
    fn dot(&self, other: &Self) -> PcgResult<f64>;

    /// `self += alpha * x`
    fn axpy(&mut self, alpha: f64, x: &Self) -> PcgResult<()>;

    /// `self *= alpha`
    fn scale(&mut self, alpha: f64);

    /// `⟨self, self⟩`
    fn squared_norm(&self) -> f64;

    /// Total number of scalar entries
    fn dim(&self) -> usize;

    fn norm(&self) -> f64 {
        self.squared_norm().sqrt()
    }
}

impl VectorSpace for nalgebra::DVector<f64> {
    fn dot(&self, other: &Self) -> PcgResult<f64> {
        if self.len() != other.len() {
            return Err(PcgError::dimension_mismatch("vector dot", self.len(), other.len()));
        }
        Ok(nalgebra::Matrix::dot(self, other))
    }

    fn axpy(&mut self, alpha: f64, x: &Self) -> PcgResult<()> {
        if self.len() != x.len() {
            return Err(PcgError::dimension_mismatch("vector axpy", self.len(), x.len()));
        }
        nalgebra::Matrix::axpy(self, alpha, x, 1.0);
        Ok(())
    }

    fn scale(&mut self, alpha: f64) {
        *self *= alpha;
    }

    fn squared_norm(&self) -> f64 {
        self.norm_squared()
    }

    fn dim(&self) -> usize {
        self.len()
    }
}

/// Utility functions for sparse matrix operations
pub mod conversions {
    use super::*;

    /// Create sparse matrix from triplets using faer
    ///
    /// Duplicate entries are summed.
    pub fn triplets_to_sparse(
        rows: usize,
        cols: usize,
        row_indices: &[usize],
        col_indices: &[usize],
        values: &[f64],
    ) -> PcgResult<SparseMatrix> {
        if row_indices.len() != col_indices.len() || row_indices.len() != values.len() {
            return Err(PcgError::dimension_mismatch(
                "triplet arrays",
                row_indices.len(),
                col_indices.len().min(values.len()),
            ));
        }
        let triplets: Vec<_> = row_indices
            .iter()
            .zip(col_indices.iter())
            .zip(values.iter())
            .map(|((&row, &col), &val)| faer::sparse::Triplet::new(row, col, val))
            .collect();

        faer::sparse::SparseColMat::try_new_from_triplets(rows, cols, &triplets).map_err(|e| {
            PcgError::InvalidInput(format!("Failed to create sparse matrix: {:?}", e))
        })
    }
}
