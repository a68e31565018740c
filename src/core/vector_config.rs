//! Variable-keyed collection of dense vectors.
//!
//! A `VectorConfig` holds one dense block per variable. Blocks are kept in
//! key order so every reduction (dot products, norms) visits them in the same
//! sequence, which keeps repeated solves bit-for-bit reproducible.

use crate::core::{Key, Ordering};
use crate::error::{PcgError, PcgResult};
use crate::linalg::VectorSpace;
use nalgebra::DVector;
use std::collections::BTreeMap;
use std::fmt;

/// Mapping from variable key to a dense real vector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorConfig {
    values: BTreeMap<Key, DVector<f64>>,
}

impl VectorConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration of zero blocks with the given dimensions
    pub fn zero(dims: &BTreeMap<Key, usize>) -> Self {
        let values = dims
            .iter()
            .map(|(&key, &dim)| (key, DVector::zeros(dim)))
            .collect();
        Self { values }
    }

    /// Insert or replace the block for `key`
    pub fn insert(&mut self, key: Key, value: DVector<f64>) -> Option<DVector<f64>> {
        self.values.insert(key, value)
    }

    /// Builder-style insert
    pub fn with(mut self, key: Key, value: DVector<f64>) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn get(&self, key: Key) -> Option<&DVector<f64>> {
        self.values.get(&key)
    }

    /// Get the block for `key`, failing when it is absent
    pub fn try_get(&self, key: Key) -> PcgResult<&DVector<f64>> {
        self.values.get(&key).ok_or(PcgError::MissingVariable(key))
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> PcgResult<&mut DVector<f64>> {
        self.values
            .get_mut(&key)
            .ok_or(PcgError::MissingVariable(key))
    }

    pub fn contains_key(&self, key: Key) -> bool {
        self.values.contains_key(&key)
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &DVector<f64>)> {
        self.values.iter().map(|(&k, v)| (k, v))
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Block dimension per key
    pub fn dims(&self) -> BTreeMap<Key, usize> {
        self.values.iter().map(|(&k, v)| (k, v.len())).collect()
    }

    /// Total number of scalar entries
    pub fn total_dim(&self) -> usize {
        self.values.values().map(|v| v.len()).sum()
    }

    /// `self + other`, both must have the same layout
    pub fn add(&self, other: &Self) -> PcgResult<Self> {
        let mut result = self.clone();
        result.axpy(1.0, other)?;
        Ok(result)
    }

    /// `self - other`, both must have the same layout
    pub fn sub(&self, other: &Self) -> PcgResult<Self> {
        let mut result = self.clone();
        result.axpy(-1.0, other)?;
        Ok(result)
    }

    /// `alpha * self`
    pub fn scaled(&self, alpha: f64) -> Self {
        let mut result = self.clone();
        result.scale(alpha);
        result
    }

    /// Largest absolute entry-wise difference, infinite when layouts differ
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        if self.dims() != other.dims() {
            return f64::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.values())
            .map(|((_, a), b)| (a - b).amax())
            .fold(0.0, f64::max)
    }

    /// Flatten into one vector following `ordering`
    pub fn vector(&self, ordering: &Ordering) -> PcgResult<DVector<f64>> {
        let mut blocks = Vec::with_capacity(ordering.len());
        for key in ordering.iter() {
            blocks.push(self.try_get(key)?);
        }
        let total = blocks.iter().map(|b| b.len()).sum();
        let mut flat = DVector::zeros(total);
        let mut offset = 0;
        for block in blocks {
            flat.rows_mut(offset, block.len()).copy_from(block);
            offset += block.len();
        }
        Ok(flat)
    }

    /// Rebuild a configuration from a flat vector, an ordering and block dimensions
    pub fn from_vector(
        v: &DVector<f64>,
        ordering: &Ordering,
        dims: &BTreeMap<Key, usize>,
    ) -> PcgResult<Self> {
        let mut values = BTreeMap::new();
        let mut offset = 0;
        for key in ordering.iter() {
            let dim = *dims.get(&key).ok_or(PcgError::MissingVariable(key))?;
            if offset + dim > v.len() {
                return Err(PcgError::dimension_mismatch(
                    "flat vector length",
                    offset + dim,
                    v.len(),
                ));
            }
            values.insert(key, v.rows(offset, dim).into_owned());
            offset += dim;
        }
        if offset != v.len() {
            return Err(PcgError::dimension_mismatch(
                "flat vector length",
                offset,
                v.len(),
            ));
        }
        Ok(Self { values })
    }

    fn check_layout(&self, other: &Self, context: &str) -> PcgResult<()> {
        if self.values.len() != other.values.len() {
            return Err(PcgError::dimension_mismatch(
                context,
                self.values.len(),
                other.values.len(),
            ));
        }
        for ((&ka, a), (&kb, b)) in self.values.iter().zip(other.values.iter()) {
            if ka != kb {
                return Err(PcgError::MissingVariable(ka.min(kb)));
            }
            if a.len() != b.len() {
                return Err(PcgError::dimension_mismatch(context, a.len(), b.len()));
            }
        }
        Ok(())
    }
}

impl VectorSpace for VectorConfig {
    fn dot(&self, other: &Self) -> PcgResult<f64> {
        self.check_layout(other, "vector config dot")?;
        Ok(self
            .values
            .values()
            .zip(other.values.values())
            .map(|(a, b)| a.dot(b))
            .sum())
    }

    fn axpy(&mut self, alpha: f64, x: &Self) -> PcgResult<()> {
        self.check_layout(x, "vector config axpy")?;
        for (a, b) in self.values.values_mut().zip(x.values.values()) {
            a.axpy(alpha, b, 1.0);
        }
        Ok(())
    }

    fn scale(&mut self, alpha: f64) {
        for v in self.values.values_mut() {
            *v *= alpha;
        }
    }

    fn squared_norm(&self) -> f64 {
        self.values.values().map(|v| v.norm_squared()).sum()
    }

    fn dim(&self) -> usize {
        self.total_dim()
    }
}

impl FromIterator<(Key, DVector<f64>)> for VectorConfig {
    fn from_iter<I: IntoIterator<Item = (Key, DVector<f64>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VectorConfig ({} variables):", self.values.len())?;
        for (key, value) in &self.values {
            let entries: Vec<String> = value.iter().map(|v| format!("{v:.6}")).collect();
            writeln!(f, "  x{key}: [{}]", entries.join(", "))?;
        }
        Ok(())
    }
}
