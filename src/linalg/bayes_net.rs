//! Triangular factorization `R·x = d` produced by elimination.
//!
//! A `GaussianBayesNet` is a list of conditionals in elimination order. Each
//! conditional `R·x_j + Σ S_p·x_p = d` has a square upper-triangular `R` and
//! only refers to parents eliminated after it, so the stacked system is block
//! upper triangular and is solved by walking the list backwards.

use crate::core::{Key, VectorConfig};
use crate::error::{PcgError, PcgResult};
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Pivots at or below this fraction of the largest entry of `R` count as zero
pub const PIVOT_TOLERANCE: f64 = 1e-12;

/// One block row `R·x_key + Σ S_p·x_p = d` of a triangular factorization
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianConditional {
    key: Key,
    r: DMatrix<f64>,
    parents: Vec<(Key, DMatrix<f64>)>,
    d: DVector<f64>,
}

impl GaussianConditional {
    /// Create a conditional, rejecting non-square or singular `R`
    pub fn new(
        key: Key,
        r: DMatrix<f64>,
        parents: Vec<(Key, DMatrix<f64>)>,
        d: DVector<f64>,
    ) -> PcgResult<Self> {
        if !r.is_square() {
            return Err(PcgError::DegenerateSystem(format!(
                "conditional on x{key} has non-square R ({}x{})",
                r.nrows(),
                r.ncols()
            )));
        }
        if d.len() != r.nrows() {
            return Err(PcgError::dimension_mismatch(
                format!("rhs of conditional on x{key}"),
                r.nrows(),
                d.len(),
            ));
        }
        for (parent, s) in &parents {
            if *parent == key {
                return Err(PcgError::InvalidInput(format!(
                    "conditional on x{key} lists itself as a parent"
                )));
            }
            if s.nrows() != r.nrows() {
                return Err(PcgError::dimension_mismatch(
                    format!("rows of S for parent x{parent}"),
                    r.nrows(),
                    s.nrows(),
                ));
            }
        }

        let r = r.upper_triangle();
        let scale = r.amax();
        for i in 0..r.nrows() {
            if r[(i, i)].abs() <= PIVOT_TOLERANCE * scale || !r[(i, i)].is_finite() {
                return Err(PcgError::DegenerateSystem(format!(
                    "zero pivot {} of x{key} (|R_ii| = {:.3e})",
                    i,
                    r[(i, i)].abs()
                )));
            }
        }

        Ok(Self { key, r, parents, d })
    }

    /// Frontal variable
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn parents(&self) -> &[(Key, DMatrix<f64>)] {
        &self.parents
    }

    pub fn d(&self) -> &DVector<f64> {
        &self.d
    }

    /// Dimension of the frontal variable
    pub fn dim(&self) -> usize {
        self.r.nrows()
    }

    /// `x_key = R⁻¹·(rhs - Σ S_p·x_p)` given already solved parents
    fn solve_frontal(&self, rhs: &DVector<f64>, x: &VectorConfig) -> PcgResult<DVector<f64>> {
        let mut v = rhs.clone();
        for (parent, s) in &self.parents {
            let xp = x.try_get(*parent)?;
            v.gemv(-1.0, s, xp, 1.0);
        }
        self.r.solve_upper_triangular(&v).ok_or_else(|| {
            PcgError::DegenerateSystem(format!("back-substitution failed for x{}", self.key))
        })
    }

    /// `R·x_key + Σ S_p·x_p`
    fn multiply(&self, x: &VectorConfig) -> PcgResult<DVector<f64>> {
        let xj = x.try_get(self.key)?;
        if xj.len() != self.dim() {
            return Err(PcgError::dimension_mismatch(
                format!("block of x{}", self.key),
                self.dim(),
                xj.len(),
            ));
        }
        let mut v = &self.r * xj;
        for (parent, s) in &self.parents {
            let xp = x.try_get(*parent)?;
            if xp.len() != s.ncols() {
                return Err(PcgError::dimension_mismatch(
                    format!("block of x{parent}"),
                    s.ncols(),
                    xp.len(),
                ));
            }
            v.gemv(1.0, s, xp, 1.0);
        }
        Ok(v)
    }
}

/// Ordered list of conditionals forming a block upper-triangular system
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaussianBayesNet {
    conditionals: Vec<GaussianConditional>,
}

impl GaussianBayesNet {
    /// Build a Bayes net from conditionals in elimination order
    ///
    /// Every frontal key must be unique and every parent must be the frontal
    /// variable of a later conditional with a matching dimension.
    pub fn from_conditionals(conditionals: Vec<GaussianConditional>) -> PcgResult<Self> {
        let mut position: HashMap<Key, usize> = HashMap::with_capacity(conditionals.len());
        for (i, conditional) in conditionals.iter().enumerate() {
            if position.insert(conditional.key, i).is_some() {
                return Err(PcgError::InvalidInput(format!(
                    "x{} is eliminated twice",
                    conditional.key
                )));
            }
        }
        for (i, conditional) in conditionals.iter().enumerate() {
            for (parent, s) in &conditional.parents {
                let j = *position.get(parent).ok_or_else(|| {
                    PcgError::DegenerateSystem(format!(
                        "parent x{parent} of x{} is never eliminated",
                        conditional.key
                    ))
                })?;
                if j <= i {
                    return Err(PcgError::InvalidInput(format!(
                        "parent x{parent} of x{} is eliminated before its child",
                        conditional.key
                    )));
                }
                if s.ncols() != conditionals[j].dim() {
                    return Err(PcgError::dimension_mismatch(
                        format!("columns of S for parent x{parent}"),
                        conditionals[j].dim(),
                        s.ncols(),
                    ));
                }
            }
        }
        Ok(Self { conditionals })
    }

    pub fn len(&self) -> usize {
        self.conditionals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditionals.is_empty()
    }

    pub fn conditionals(&self) -> &[GaussianConditional] {
        &self.conditionals
    }

    /// Frontal keys in elimination order
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.conditionals.iter().map(|c| c.key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.conditionals.iter().any(|c| c.key == key)
    }

    pub fn dims(&self) -> BTreeMap<Key, usize> {
        self.conditionals.iter().map(|c| (c.key, c.dim())).collect()
    }

    /// Back-substitution for `R·x = d`
    pub fn solve(&self) -> PcgResult<VectorConfig> {
        let mut x = VectorConfig::new();
        for conditional in self.conditionals.iter().rev() {
            let xj = conditional.solve_frontal(&conditional.d, &x)?;
            x.insert(conditional.key, xj);
        }
        Ok(x)
    }

    /// `R⁻¹·y`, i.e. back-substitution with `y` in place of `d`
    pub fn back_substitute(&self, y: &VectorConfig) -> PcgResult<VectorConfig> {
        let mut x = VectorConfig::new();
        for conditional in self.conditionals.iter().rev() {
            let yj = y.try_get(conditional.key)?;
            if yj.len() != conditional.dim() {
                return Err(PcgError::dimension_mismatch(
                    format!("block of x{}", conditional.key),
                    conditional.dim(),
                    yj.len(),
                ));
            }
            let xj = conditional.solve_frontal(yj, &x)?;
            x.insert(conditional.key, xj);
        }
        Ok(x)
    }

    /// `R⁻ᵀ·e`, forward substitution through the transposed system
    pub fn back_substitute_transpose(&self, e: &VectorConfig) -> PcgResult<VectorConfig> {
        let mut rhs: BTreeMap<Key, DVector<f64>> = BTreeMap::new();
        for conditional in &self.conditionals {
            let ej = e.try_get(conditional.key)?;
            if ej.len() != conditional.dim() {
                return Err(PcgError::dimension_mismatch(
                    format!("block of x{}", conditional.key),
                    conditional.dim(),
                    ej.len(),
                ));
            }
            rhs.insert(conditional.key, ej.clone());
        }

        let mut z = VectorConfig::new();
        for conditional in &self.conditionals {
            let v = rhs
                .remove(&conditional.key)
                .ok_or(PcgError::MissingVariable(conditional.key))?;
            let zj = conditional.r.tr_solve_upper_triangular(&v).ok_or_else(|| {
                PcgError::DegenerateSystem(format!(
                    "transpose substitution failed for x{}",
                    conditional.key
                ))
            })?;
            for (parent, s) in &conditional.parents {
                let target = rhs
                    .get_mut(parent)
                    .ok_or(PcgError::MissingVariable(*parent))?;
                target.gemv_tr(-1.0, s, &zj, 1.0);
            }
            z.insert(conditional.key, zj);
        }
        Ok(z)
    }

    /// `R·x`, one block per frontal variable
    pub fn multiply(&self, x: &VectorConfig) -> PcgResult<VectorConfig> {
        let mut out = VectorConfig::new();
        for conditional in &self.conditionals {
            out.insert(conditional.key, conditional.multiply(x)?);
        }
        Ok(out)
    }

    /// Right-hand side `d` (the `c1` of a subgraph factorization)
    pub fn rhs(&self) -> VectorConfig {
        self.conditionals
            .iter()
            .map(|c| (c.key, c.d.clone()))
            .collect()
    }

    /// `R·x - d`
    pub fn residual(&self, x: &VectorConfig) -> PcgResult<VectorConfig> {
        self.multiply(x)?.sub(&self.rhs())
    }
}

impl fmt::Display for GaussianBayesNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GaussianBayesNet ({} conditionals):", self.len())?;
        for conditional in &self.conditionals {
            let parents: Vec<String> = conditional
                .parents
                .iter()
                .map(|(k, _)| format!("x{k}"))
                .collect();
            writeln!(
                f,
                "  p(x{} | {}) dim {}",
                conditional.key,
                parents.join(", "),
                conditional.dim()
            )?;
        }
        Ok(())
    }
}
