//! Linear factor graph `A·x = b`.
//!
//! Factors are stored in insertion order; that order defines the layout of
//! every `Errors` the graph produces and the row order of its matrix forms.

use crate::core::{Errors, JacobianFactor, Key, Ordering, VectorConfig};
use crate::error::{PcgError, PcgResult};
use crate::linalg::{GaussianBayesNet, SparseMatrix, conversions, elimination};
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Sparse linear least-squares system as a sequence of Jacobian factors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaussianFactorGraph {
    factors: Vec<JacobianFactor>,
}

impl GaussianFactorGraph {
    /// Creates a new, empty factor graph
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_factors(factors: Vec<JacobianFactor>) -> Self {
        Self { factors }
    }

    pub fn add(&mut self, factor: JacobianFactor) {
        self.factors.push(factor);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn factors(&self) -> &[JacobianFactor] {
        &self.factors
    }

    /// New graph with the factors at `indices`, in the given order
    pub fn subset(&self, indices: &[usize]) -> PcgResult<Self> {
        let mut factors = Vec::with_capacity(indices.len());
        for &i in indices {
            let factor = self.factors.get(i).ok_or_else(|| {
                PcgError::InvalidInput(format!(
                    "Factor index {i} out of range for graph with {} factors",
                    self.factors.len()
                ))
            })?;
            factors.push(factor.clone());
        }
        Ok(Self { factors })
    }

    /// All variable keys referenced by any factor
    pub fn keys(&self) -> BTreeSet<Key> {
        self.factors.iter().flat_map(|f| f.keys()).collect()
    }

    /// Block width per variable, rejecting inconsistent widths across factors
    pub fn dims(&self) -> PcgResult<BTreeMap<Key, usize>> {
        let mut dims = BTreeMap::new();
        for factor in &self.factors {
            for (key, block) in factor.terms() {
                let width = *dims.entry(*key).or_insert(block.ncols());
                if width != block.ncols() {
                    return Err(PcgError::dimension_mismatch(
                        format!("width of x{key} across factors"),
                        width,
                        block.ncols(),
                    ));
                }
            }
        }
        Ok(dims)
    }

    /// Total number of residual rows
    pub fn rows(&self) -> usize {
        self.factors.iter().map(|f| f.rows()).sum()
    }

    /// Per-factor residuals `A_i·x - b_i`
    pub fn errors(&self, x: &VectorConfig) -> PcgResult<Errors> {
        self.factors.iter().map(|f| f.error_vector(x)).collect()
    }

    /// `Σ_i ‖A_i·x - b_i‖²`, accumulated factor by factor
    pub fn squared_error(&self, x: &VectorConfig) -> PcgResult<f64> {
        let mut total = 0.0;
        for factor in &self.factors {
            total += factor.squared_error(x)?;
        }
        Ok(total)
    }

    /// Least-squares objective `½·Σ_i ‖A_i·x - b_i‖²`
    pub fn error(&self, x: &VectorConfig) -> PcgResult<f64> {
        Ok(0.5 * self.squared_error(x)?)
    }

    /// Per-factor products `A_i·x`
    pub fn multiply(&self, x: &VectorConfig) -> PcgResult<Errors> {
        self.factors.iter().map(|f| f.multiply(x)).collect()
    }

    /// `Aᵀ·e`, with a (possibly zero) block for every variable of the graph
    pub fn transpose_multiply(&self, e: &Errors) -> PcgResult<VectorConfig> {
        let mut out = VectorConfig::zero(&self.dims()?);
        self.transpose_multiply_add(1.0, e, &mut out)?;
        Ok(out)
    }

    /// `out += alpha·Aᵀ·e`
    pub fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &Errors,
        out: &mut VectorConfig,
    ) -> PcgResult<()> {
        if e.len() != self.factors.len() {
            return Err(PcgError::dimension_mismatch(
                "errors per factor",
                self.factors.len(),
                e.len(),
            ));
        }
        for (factor, ei) in self.factors.iter().zip(e.iter()) {
            factor.transpose_multiply_add(alpha, ei, out)?;
        }
        Ok(())
    }

    /// Right-hand sides split by factor
    pub fn rhs(&self) -> Errors {
        self.factors.iter().map(|f| f.b().clone()).collect()
    }

    /// Right-hand sides stacked into one vector
    pub fn rhs_vector(&self) -> DVector<f64> {
        let mut b = DVector::zeros(self.rows());
        let mut row = 0;
        for factor in &self.factors {
            b.rows_mut(row, factor.rows()).copy_from(factor.b());
            row += factor.rows();
        }
        b
    }

    /// Column offset of every key in `ordering`, plus the total column count
    fn column_offsets(
        &self,
        ordering: &Ordering,
        dims: &BTreeMap<Key, usize>,
    ) -> PcgResult<(BTreeMap<Key, usize>, usize)> {
        for (key, width) in self.dims()? {
            if !ordering.contains(key) {
                return Err(PcgError::InvalidInput(format!(
                    "Ordering does not contain variable x{key}"
                )));
            }
            match dims.get(&key) {
                Some(&dim) if dim == width => {}
                Some(&dim) => {
                    return Err(PcgError::dimension_mismatch(
                        format!("column width of x{key}"),
                        dim,
                        width,
                    ));
                }
                None => return Err(PcgError::MissingVariable(key)),
            }
        }
        let mut offsets = BTreeMap::new();
        let mut col = 0;
        for key in ordering.iter() {
            offsets.insert(key, col);
            col += dims.get(&key).copied().unwrap_or(0);
        }
        Ok((offsets, col))
    }

    /// Dense `(A, b)` with columns laid out by `ordering`
    pub fn matrix(&self, ordering: &Ordering) -> PcgResult<(DMatrix<f64>, DVector<f64>)> {
        self.matrix_with_dims(ordering, &self.dims()?)
    }

    /// Dense `(A, b)` over the variables in `dims`, including ones no factor
    /// of this graph touches (their columns are zero)
    pub fn matrix_with_dims(
        &self,
        ordering: &Ordering,
        dims: &BTreeMap<Key, usize>,
    ) -> PcgResult<(DMatrix<f64>, DVector<f64>)> {
        let (offsets, ncols) = self.column_offsets(ordering, dims)?;
        let mut a = DMatrix::zeros(self.rows(), ncols);
        let mut row = 0;
        for factor in &self.factors {
            for (key, block) in factor.terms() {
                let col = offsets[key];
                a.view_mut((row, col), block.shape()).copy_from(block);
            }
            row += factor.rows();
        }
        Ok((a, self.rhs_vector()))
    }

    /// Sparse `A` with columns laid out by `ordering`
    pub fn sparse(&self, ordering: &Ordering) -> PcgResult<SparseMatrix> {
        self.sparse_with_dims(ordering, &self.dims()?)
    }

    /// Sparse counterpart of [`Self::matrix_with_dims`]
    pub fn sparse_with_dims(
        &self,
        ordering: &Ordering,
        dims: &BTreeMap<Key, usize>,
    ) -> PcgResult<SparseMatrix> {
        let (offsets, ncols) = self.column_offsets(ordering, dims)?;
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut values = Vec::new();
        let mut row = 0;
        for factor in &self.factors {
            for (key, block) in factor.terms() {
                let col = offsets[key];
                for j in 0..block.ncols() {
                    for i in 0..block.nrows() {
                        let value = block[(i, j)];
                        if value != 0.0 {
                            rows.push(row + i);
                            cols.push(col + j);
                            values.push(value);
                        }
                    }
                }
            }
            row += factor.rows();
        }
        conversions::triplets_to_sparse(self.rows(), ncols, &rows, &cols, &values)
    }

    /// Rebuild a keyed configuration from a flat vector laid out by `ordering`
    pub fn assemble_config(&self, v: &DVector<f64>, ordering: &Ordering) -> PcgResult<VectorConfig> {
        VectorConfig::from_vector(v, ordering, &self.dims()?)
    }

    /// Eliminate every variable in `ordering`, producing `R·x = d`
    pub fn eliminate(&self, ordering: &Ordering) -> PcgResult<GaussianBayesNet> {
        elimination::eliminate(self, ordering)
    }

    /// Get graph statistics
    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics {
            num_factors: self.len(),
            num_variables: self.keys().len(),
            total_residual_dimension: self.rows(),
        }
    }
}

impl FromIterator<JacobianFactor> for GaussianFactorGraph {
    fn from_iter<I: IntoIterator<Item = JacobianFactor>>(iter: I) -> Self {
        Self {
            factors: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for GaussianFactorGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GaussianFactorGraph ({} factors):", self.len())?;
        for (i, factor) in self.factors.iter().enumerate() {
            writeln!(f, "  Factor {i}: {factor}")?;
        }
        Ok(())
    }
}

/// Graph statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStatistics {
    pub num_factors: usize,
    pub num_variables: usize,
    pub total_residual_dimension: usize,
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Statistics:")?;
        writeln!(f, "  Factors: {}", self.num_factors)?;
        writeln!(f, "  Variables: {}", self.num_variables)?;
        writeln!(
            f,
            "  Total residual dimension: {}",
            self.total_residual_dimension
        )?;
        Ok(())
    }
}
