//! Linear (Jacobian) factors.
//!
//! A `JacobianFactor` is one block row of the sparse system: the residual
//! `Σ_j A_j·x_j - b` over the variables it touches.

use crate::core::{Key, VectorConfig};
use crate::error::{PcgError, PcgResult};
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// A block row `[A_1 .. A_k | b]` of a linear least-squares system
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor {
    terms: Vec<(Key, DMatrix<f64>)>,
    b: DVector<f64>,
}

impl JacobianFactor {
    /// Create a factor from `(key, A_j)` terms and a right-hand side
    ///
    /// Every block must have `b.len()` rows and at least one column, and keys
    /// must be unique within the factor.
    pub fn new(terms: Vec<(Key, DMatrix<f64>)>, b: DVector<f64>) -> PcgResult<Self> {
        if terms.is_empty() {
            return Err(PcgError::InvalidInput(
                "Jacobian factor needs at least one term".into(),
            ));
        }
        if b.is_empty() {
            return Err(PcgError::InvalidInput(
                "Jacobian factor needs at least one row".into(),
            ));
        }
        for (i, (key, block)) in terms.iter().enumerate() {
            if block.nrows() != b.len() {
                return Err(PcgError::dimension_mismatch(
                    format!("rows of block for x{key}"),
                    b.len(),
                    block.nrows(),
                ));
            }
            if block.ncols() == 0 {
                return Err(PcgError::InvalidInput(format!(
                    "Block for x{key} has no columns"
                )));
            }
            if terms[..i].iter().any(|(k, _)| k == key) {
                return Err(PcgError::InvalidInput(format!(
                    "Key {key} appears twice in one factor"
                )));
            }
        }
        Ok(Self { terms, b })
    }

    /// Unary factor `A·x_key - b`
    pub fn unary(key: Key, a: DMatrix<f64>, b: DVector<f64>) -> PcgResult<Self> {
        Self::new(vec![(key, a)], b)
    }

    /// Binary factor `A1·x_key1 + A2·x_key2 - b`
    pub fn binary(
        key1: Key,
        a1: DMatrix<f64>,
        key2: Key,
        a2: DMatrix<f64>,
        b: DVector<f64>,
    ) -> PcgResult<Self> {
        Self::new(vec![(key1, a1), (key2, a2)], b)
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.terms.iter().map(|(k, _)| *k)
    }

    pub fn terms(&self) -> &[(Key, DMatrix<f64>)] {
        &self.terms
    }

    pub fn block(&self, key: Key) -> Option<&DMatrix<f64>> {
        self.terms.iter().find(|(k, _)| *k == key).map(|(_, a)| a)
    }

    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    /// Number of residual rows
    pub fn rows(&self) -> usize {
        self.b.len()
    }

    /// `A·x`
    pub fn multiply(&self, x: &VectorConfig) -> PcgResult<DVector<f64>> {
        let mut ax = DVector::zeros(self.rows());
        for (key, block) in &self.terms {
            let xj = x.try_get(*key)?;
            if xj.len() != block.ncols() {
                return Err(PcgError::dimension_mismatch(
                    format!("block width for x{key}"),
                    block.ncols(),
                    xj.len(),
                ));
            }
            ax.gemv(1.0, block, xj, 1.0);
        }
        Ok(ax)
    }

    /// Residual `A·x - b`
    pub fn error_vector(&self, x: &VectorConfig) -> PcgResult<DVector<f64>> {
        Ok(self.multiply(x)? - &self.b)
    }

    /// `‖A·x - b‖²`
    pub fn squared_error(&self, x: &VectorConfig) -> PcgResult<f64> {
        Ok(self.error_vector(x)?.norm_squared())
    }

    /// `out += alpha·Aᵀ·e`, creating missing blocks in `out`
    pub fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &DVector<f64>,
        out: &mut VectorConfig,
    ) -> PcgResult<()> {
        if e.len() != self.rows() {
            return Err(PcgError::dimension_mismatch(
                "factor residual length",
                self.rows(),
                e.len(),
            ));
        }
        for (key, block) in &self.terms {
            if !out.contains_key(*key) {
                out.insert(*key, DVector::zeros(block.ncols()));
            }
            let target = out.get_mut(*key)?;
            if target.len() != block.ncols() {
                return Err(PcgError::dimension_mismatch(
                    format!("block width for x{key}"),
                    block.ncols(),
                    target.len(),
                ));
            }
            target.gemv_tr(alpha, block, e, 1.0);
        }
        Ok(())
    }

    /// Frobenius norm of the whole left-hand side `[A_1 .. A_k]`
    pub fn frobenius_norm(&self) -> f64 {
        self.terms
            .iter()
            .map(|(_, a)| a.norm_squared())
            .sum::<f64>()
            .sqrt()
    }
}

impl fmt::Display for JacobianFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys().map(|k| format!("x{k}")).collect();
        write!(
            f,
            "JacobianFactor [{}] ({} rows)",
            keys.join(", "),
            self.rows()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn between() -> JacobianFactor {
        JacobianFactor::binary(
            0,
            DMatrix::from_row_slice(1, 1, &[-1.0]),
            1,
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DVector::from_vec(vec![2.0]),
        )
        .unwrap()
    }

    #[test]
    fn test_error_vector() {
        let factor = between();
        let x = VectorConfig::new()
            .with(0, DVector::from_vec(vec![1.0]))
            .with(1, DVector::from_vec(vec![4.0]));
        assert_eq!(factor.error_vector(&x).unwrap()[0], 1.0);
        assert_eq!(factor.squared_error(&x).unwrap(), 1.0);
    }

    #[test]
    fn test_transpose_multiply_add_creates_blocks() {
        let factor = between();
        let mut out = VectorConfig::new();
        factor
            .transpose_multiply_add(2.0, &DVector::from_vec(vec![3.0]), &mut out)
            .unwrap();
        assert_eq!(out.get(0).unwrap()[0], -6.0);
        assert_eq!(out.get(1).unwrap()[0], 6.0);
    }

    #[test]
    fn test_rejects_malformed_factors() {
        let b = DVector::from_vec(vec![1.0, 2.0]);
        assert!(JacobianFactor::new(vec![], b.clone()).is_err());
        assert!(JacobianFactor::unary(0, DMatrix::identity(1, 1), b.clone()).is_err());
        assert!(
            JacobianFactor::binary(
                0,
                DMatrix::identity(2, 2),
                0,
                DMatrix::identity(2, 2),
                b
            )
            .is_err()
        );
    }

    #[test]
    fn test_multiply_checks_block_width() {
        let factor = between();
        let x = VectorConfig::new()
            .with(0, DVector::from_vec(vec![1.0, 0.0]))
            .with(1, DVector::from_vec(vec![4.0]));
        assert!(matches!(
            factor.multiply(&x),
            Err(PcgError::DimensionMismatch { .. })
        ));
    }
}
