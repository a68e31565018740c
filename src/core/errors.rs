//! Per-factor residual sequences.

use crate::error::{PcgError, PcgResult};
use crate::linalg::VectorSpace;
use nalgebra::DVector;

/// Ordered sequence of residual vectors, one per linear factor
///
/// Used for `A·x - b` split by factor and for the output of forward
/// operators. Two `Errors` are compatible when they have the same number of
/// blocks and matching block sizes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Errors {
    blocks: Vec<DVector<f64>>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: Vec<DVector<f64>>) -> Self {
        Self { blocks }
    }

    pub fn push(&mut self, block: DVector<f64>) {
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[DVector<f64>] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = &DVector<f64>> {
        self.blocks.iter()
    }

    /// Split into the first `mid` blocks and the rest
    pub fn split_at(&self, mid: usize) -> PcgResult<(&[DVector<f64>], &[DVector<f64>])> {
        if mid > self.blocks.len() {
            return Err(PcgError::dimension_mismatch(
                "errors split",
                mid,
                self.blocks.len(),
            ));
        }
        Ok(self.blocks.split_at(mid))
    }

    /// Append all blocks of `other`
    pub fn concat(mut self, other: Errors) -> Self {
        self.blocks.extend(other.blocks);
        self
    }

    fn check_layout(&self, other: &Self, context: &str) -> PcgResult<()> {
        if self.blocks.len() != other.blocks.len() {
            return Err(PcgError::dimension_mismatch(
                context,
                self.blocks.len(),
                other.blocks.len(),
            ));
        }
        for (a, b) in self.blocks.iter().zip(&other.blocks) {
            if a.len() != b.len() {
                return Err(PcgError::dimension_mismatch(context, a.len(), b.len()));
            }
        }
        Ok(())
    }
}

impl VectorSpace for Errors {
    fn dot(&self, other: &Self) -> PcgResult<f64> {
        self.check_layout(other, "errors dot")?;
        Ok(self
            .blocks
            .iter()
            .zip(&other.blocks)
            .map(|(a, b)| a.dot(b))
            .sum())
    }

    fn axpy(&mut self, alpha: f64, x: &Self) -> PcgResult<()> {
        self.check_layout(x, "errors axpy")?;
        for (a, b) in self.blocks.iter_mut().zip(&x.blocks) {
            a.axpy(alpha, b, 1.0);
        }
        Ok(())
    }

    fn scale(&mut self, alpha: f64) {
        for block in &mut self.blocks {
            *block *= alpha;
        }
    }

    fn squared_norm(&self) -> f64 {
        self.blocks.iter().map(|b| b.norm_squared()).sum()
    }

    fn dim(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }
}

impl FromIterator<DVector<f64>> for Errors {
    fn from_iter<I: IntoIterator<Item = DVector<f64>>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_norm_sums_blocks() {
        let e = Errors::from_blocks(vec![
            DVector::from_vec(vec![1.0, 2.0]),
            DVector::from_vec(vec![3.0]),
        ]);
        assert_eq!(e.squared_norm(), 14.0);
        assert_eq!(e.dim(), 3);
    }

    #[test]
    fn test_split_and_concat() {
        let head = Errors::from_blocks(vec![DVector::from_vec(vec![1.0])]);
        let tail = Errors::from_blocks(vec![DVector::from_vec(vec![2.0, 3.0])]);
        let joined = head.concat(tail);
        let (a, b) = joined.split_at(1).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b[0].len(), 2);
        assert!(joined.split_at(3).is_err());
    }

    #[test]
    fn test_dot_rejects_block_size_mismatch() {
        let a = Errors::from_blocks(vec![DVector::from_vec(vec![1.0, 2.0])]);
        let b = Errors::from_blocks(vec![DVector::from_vec(vec![1.0])]);
        assert!(a.dot(&b).is_err());
    }
}
