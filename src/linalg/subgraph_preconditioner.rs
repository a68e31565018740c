//! Subgraph preconditioner.
//!
//! Starting with a graph `A·x = b`, split into a spanning tree `A1·x = b1` and
//! the loop-closing rest `A2·x = b2`. The tree is eliminated into `R1·x = c1`
//! with solution `xbar`, and the substitution `y = R1·(x - xbar)` gives
//!
//! ```text
//! x(y)   = xbar + R1⁻¹·y
//! f(y)   = ½‖y‖² + ½‖A2·R1⁻¹·y - b2bar‖² + const,   b2bar = b2 - A2·xbar
//! ∇f(y)  = y + R1⁻ᵀ·A2ᵀ·(A2·R1⁻¹·y - b2bar)
//! ```
//!
//! Conjugate gradients on `y` starts at `y = 0` (i.e. `x = xbar`) and
//! converges at a rate set by the loop closures alone; the tree part of the
//! operator is the identity.

use crate::core::{Errors, GaussianFactorGraph, Key, Ordering, VectorConfig};
use crate::error::{PcgError, PcgResult};
use crate::linalg::{GaussianBayesNet, SparseMatrix, VectorSpace};
use crate::optimizer::LeastSquaresSystem;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use std::fmt;

/// Transformed least-squares system for subgraph-preconditioned CG
#[derive(Debug, Clone)]
pub struct SubgraphPreconditioner {
    ab1: GaussianFactorGraph,
    ab2: GaussianFactorGraph,
    rc1: GaussianBayesNet,
    xbar: VectorConfig,
    /// b2 - A2·xbar
    b2bar: Errors,
}

impl SubgraphPreconditioner {
    /// Build the preconditioner from both subgraphs, the factorization
    /// `R1·x = c1` of `Ab1` and its solution `xbar`
    ///
    /// Fails with `DegenerateSystem` if `R1` leaves any variable of either
    /// subgraph free or `xbar` does not match its layout.
    pub fn new(
        ab1: GaussianFactorGraph,
        ab2: GaussianFactorGraph,
        rc1: GaussianBayesNet,
        xbar: VectorConfig,
    ) -> PcgResult<Self> {
        let mut dims = ab1.dims()?;
        for (key, dim) in ab2.dims()? {
            let width = *dims.entry(key).or_insert(dim);
            if width != dim {
                return Err(PcgError::dimension_mismatch(
                    format!("width of x{key} across subgraphs"),
                    width,
                    dim,
                ));
            }
        }

        let r_dims = rc1.dims();
        for (key, dim) in &dims {
            match r_dims.get(key) {
                None => {
                    return Err(PcgError::DegenerateSystem(format!(
                        "x{key} is not eliminated by the tree factorization"
                    )));
                }
                Some(r_dim) if r_dim != dim => {
                    return Err(PcgError::dimension_mismatch(
                        format!("factorization block of x{key}"),
                        *dim,
                        *r_dim,
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = r_dims.keys().find(|k| !dims.contains_key(k)) {
            return Err(PcgError::InvalidInput(format!(
                "factorization eliminates x{extra}, which no factor references"
            )));
        }
        if xbar.dims() != r_dims {
            return Err(PcgError::DegenerateSystem(
                "baseline solution does not match the tree factorization layout".into(),
            ));
        }

        let mut b2bar = ab2.errors(&xbar)?;
        b2bar.scale(-1.0);

        Ok(Self {
            ab1,
            ab2,
            rc1,
            xbar,
            b2bar,
        })
    }

    /// Eliminate `ab1` in `ordering` and build the preconditioner from it
    pub fn from_subgraphs(
        ab1: GaussianFactorGraph,
        ab2: GaussianFactorGraph,
        ordering: &Ordering,
    ) -> PcgResult<Self> {
        let rc1 = ab1.eliminate(ordering)?;
        let xbar = rc1.solve()?;
        Self::new(ab1, ab2, rc1, xbar)
    }

    /// Dense `[A1 | b1]` laid out by `ordering`, one column block per variable
    pub fn ab1_matrix(&self, ordering: &Ordering) -> PcgResult<(DMatrix<f64>, DVector<f64>)> {
        self.ab1.matrix_with_dims(ordering, &self.rc1.dims())
    }

    /// Dense `[A2 | b2]` with the same column layout as [`Self::ab1_matrix`]
    pub fn ab2_matrix(&self, ordering: &Ordering) -> PcgResult<(DMatrix<f64>, DVector<f64>)> {
        self.ab2.matrix_with_dims(ordering, &self.rc1.dims())
    }

    pub fn a1_sparse(&self, ordering: &Ordering) -> PcgResult<SparseMatrix> {
        self.ab1.sparse_with_dims(ordering, &self.rc1.dims())
    }

    pub fn a2_sparse(&self, ordering: &Ordering) -> PcgResult<SparseMatrix> {
        self.ab2.sparse_with_dims(ordering, &self.rc1.dims())
    }

    pub fn b1(&self) -> DVector<f64> {
        self.ab1.rhs_vector()
    }

    pub fn b2(&self) -> DVector<f64> {
        self.ab2.rhs_vector()
    }

    /// Rebuild a keyed configuration from a flat vector laid out by `ordering`
    pub fn assemble_config(&self, v: &DVector<f64>, ordering: &Ordering) -> PcgResult<VectorConfig> {
        VectorConfig::from_vector(v, ordering, &self.rc1.dims())
    }

    pub fn ab1(&self) -> &GaussianFactorGraph {
        &self.ab1
    }

    pub fn ab2(&self) -> &GaussianFactorGraph {
        &self.ab2
    }

    /// The tree factorization `R1·x = c1`
    pub fn rc1(&self) -> &GaussianBayesNet {
        &self.rc1
    }

    /// Solution of the tree subsystem
    pub fn xbar(&self) -> &VectorConfig {
        &self.xbar
    }

    /// Loop residual at the baseline, `b2 - A2·xbar`
    pub fn b2bar(&self) -> &Errors {
        &self.b2bar
    }

    /// Block dimension of every variable
    pub fn dims(&self) -> BTreeMap<Key, usize> {
        self.rc1.dims()
    }

    /// Starting point `y = 0`
    pub fn zero_y(&self) -> VectorConfig {
        VectorConfig::zero(&self.rc1.dims())
    }

    /// `x = xbar + R1⁻¹·y`
    pub fn x(&self, y: &VectorConfig) -> PcgResult<VectorConfig> {
        let mut x = self.rc1.back_substitute(y)?;
        x.axpy(1.0, &self.xbar)?;
        Ok(x)
    }

    /// `½‖A1·x(y) - b1‖² + ½‖A2·x(y) - b2‖²`, summed factor by factor
    ///
    /// Both subgraphs are evaluated at `x(y)`; the tree term is not replaced
    /// by `½‖y‖²`, so the value matches the untransformed objective exactly.
    pub fn error(&self, y: &VectorConfig) -> PcgResult<f64> {
        let x = self.x(y)?;
        Ok(self.ab1.error(&x)? + self.ab2.error(&x)?)
    }

    /// `y + R1⁻ᵀ·A2ᵀ·(A2·R1⁻¹·y - b2bar)`
    pub fn gradient(&self, y: &VectorConfig) -> PcgResult<VectorConfig> {
        let r1_inv_y = self.rc1.back_substitute(y)?;
        let mut e2 = self.ab2.multiply(&r1_inv_y)?;
        e2.axpy(-1.0, &self.b2bar)?;
        let mut gradient = self.loop_adjoint(&e2)?;
        gradient.axpy(1.0, y)?;
        Ok(gradient)
    }

    /// Forward operator: `[y; A2·R1⁻¹·y]`
    ///
    /// The tree part holds one block per conditional of `R1`, in elimination
    /// order, followed by one block per loop factor.
    pub fn apply(&self, y: &VectorConfig) -> PcgResult<Errors> {
        let mut tree = Errors::new();
        for key in self.rc1.keys() {
            tree.push(y.try_get(key)?.clone());
        }
        let r1_inv_y = self.rc1.back_substitute(y)?;
        Ok(tree.concat(self.ab2.multiply(&r1_inv_y)?))
    }

    /// Adjoint operator: `e_tree + R1⁻ᵀ·A2ᵀ·e_loop`
    pub fn apply_adjoint(&self, e: &Errors) -> PcgResult<VectorConfig> {
        let expected = self.rc1.len() + self.ab2.len();
        if e.len() != expected {
            return Err(PcgError::dimension_mismatch(
                "operator residual blocks",
                expected,
                e.len(),
            ));
        }
        let (tree, loops) = e.split_at(self.rc1.len())?;

        let mut result = self.loop_adjoint(&Errors::from_blocks(loops.to_vec()))?;
        for (conditional, block) in self.rc1.conditionals().iter().zip(tree) {
            if block.len() != conditional.dim() {
                return Err(PcgError::dimension_mismatch(
                    format!("tree residual of x{}", conditional.key()),
                    conditional.dim(),
                    block.len(),
                ));
            }
            *result.get_mut(conditional.key())? += block;
        }
        Ok(result)
    }

    /// `R1⁻ᵀ·A2ᵀ·e2`
    fn loop_adjoint(&self, e2: &Errors) -> PcgResult<VectorConfig> {
        let mut a2t_e = VectorConfig::zero(&self.rc1.dims());
        self.ab2.transpose_multiply_add(1.0, e2, &mut a2t_e)?;
        self.rc1.back_substitute_transpose(&a2t_e)
    }
}

impl LeastSquaresSystem for SubgraphPreconditioner {
    type Vector = VectorConfig;
    type Residual = Errors;

    fn error(&self, y: &VectorConfig) -> PcgResult<f64> {
        SubgraphPreconditioner::error(self, y)
    }

    fn gradient(&self, y: &VectorConfig) -> PcgResult<VectorConfig> {
        SubgraphPreconditioner::gradient(self, y)
    }

    fn apply(&self, y: &VectorConfig) -> PcgResult<Errors> {
        SubgraphPreconditioner::apply(self, y)
    }

    fn apply_adjoint(&self, e: &Errors) -> PcgResult<VectorConfig> {
        SubgraphPreconditioner::apply_adjoint(self, e)
    }
}

impl fmt::Display for SubgraphPreconditioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SubgraphPreconditioner:")?;
        writeln!(
            f,
            "  tree: {} factors, {} conditionals",
            self.ab1.len(),
            self.rc1.len()
        )?;
        writeln!(f, "  loops: {} factors", self.ab2.len())?;
        writeln!(f, "  variables: {} (dim {})", self.xbar.len(), self.xbar.dim())?;
        write!(f, "  |b2bar|: {:.6e}", self.b2bar.norm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JacobianFactor;
    use crate::linalg::SubgraphBuilder;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_config(rng: &mut StdRng, dims: &BTreeMap<Key, usize>) -> VectorConfig {
        dims.iter()
            .map(|(&k, &d)| (k, DVector::from_fn(d, |_, _| rng.random_range(-1.0..1.0))))
            .collect()
    }

    /// 2-D square loop with a prior and a diagonal brace
    fn loop_graph() -> GaussianFactorGraph {
        let i2 = DMatrix::<f64>::identity(2, 2);
        let rot = DMatrix::from_row_slice(2, 2, &[0.8, -0.6, 0.6, 0.8]);
        let mut graph = GaussianFactorGraph::new();
        graph.add(JacobianFactor::unary(0, i2.scale(2.0), DVector::from_vec(vec![0.1, -0.2])).unwrap());
        let edges = [
            (0, 1, vec![1.0, 0.0]),
            (1, 2, vec![0.0, 1.0]),
            (2, 3, vec![-1.0, 0.1]),
            (3, 0, vec![0.1, -1.0]),
            (0, 2, vec![1.1, 0.9]),
        ];
        for (a, b, z) in edges {
            graph.add(
                JacobianFactor::binary(a, -&rot, b, i2.clone(), DVector::from_vec(z)).unwrap(),
            );
        }
        graph
    }

    fn preconditioner() -> SubgraphPreconditioner {
        let graph = loop_graph();
        let subgraph = SubgraphBuilder::default().build(&graph).unwrap();
        let (ab1, ab2) = subgraph.split(&graph).unwrap();
        SubgraphPreconditioner::from_subgraphs(ab1, ab2, &subgraph.ordering).unwrap()
    }

    #[test]
    fn test_x_of_zero_is_xbar() {
        let system = preconditioner();
        let x0 = system.x(&system.zero_y()).unwrap();
        assert_eq!(x0.max_abs_diff(system.xbar()), 0.0);
        let residual = system.rc1().residual(system.xbar()).unwrap();
        assert!(residual.norm() < 1e-12);
    }

    #[test]
    fn test_adjoint_identity() {
        let system = preconditioner();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let y = random_config(&mut rng, &system.dims());
            let ay = system.apply(&y).unwrap();
            let e: Errors = ay
                .iter()
                .map(|b| DVector::from_fn(b.len(), |_, _| rng.random_range(-1.0..1.0)))
                .collect();
            let lhs = ay.dot(&e).unwrap();
            let rhs = y.dot(&system.apply_adjoint(&e).unwrap()).unwrap();
            assert!((lhs - rhs).abs() < 1e-10 * (1.0 + lhs.abs()));
        }
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let system = preconditioner();
        let mut rng = StdRng::seed_from_u64(11);
        let y = random_config(&mut rng, &system.dims());
        let gradient = system.gradient(&y).unwrap();

        let h = 1e-6;
        for (key, g) in gradient.iter() {
            for i in 0..g.len() {
                let mut plus = y.clone();
                plus.get_mut(key).unwrap()[i] += h;
                let mut minus = y.clone();
                minus.get_mut(key).unwrap()[i] -= h;
                let numeric =
                    (system.error(&plus).unwrap() - system.error(&minus).unwrap()) / (2.0 * h);
                let scale = g[i].abs().max(1.0);
                assert!(
                    (numeric - g[i]).abs() < 1e-5 * scale,
                    "x{key}[{i}]: analytic {} numeric {numeric}",
                    g[i]
                );
            }
        }
    }

    #[test]
    fn test_error_decomposes_over_subgraphs() {
        let system = preconditioner();
        let mut rng = StdRng::seed_from_u64(3);
        let y = random_config(&mut rng, &system.dims());
        let x = system.x(&y).unwrap();
        let expected =
            0.5 * (system.ab1().squared_error(&x).unwrap() + system.ab2().squared_error(&x).unwrap());
        assert!((system.error(&y).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_is_adjoint_of_residual() {
        // ∇f(y) = Aᵀ·(A·y - [0; b2bar])
        let system = preconditioner();
        let mut rng = StdRng::seed_from_u64(5);
        let y = random_config(&mut rng, &system.dims());
        let mut residual = system.apply(&y).unwrap();
        let mut shift = Errors::new();
        for conditional in system.rc1().conditionals() {
            shift.push(DVector::zeros(conditional.dim()));
        }
        let shift = shift.concat(system.b2bar().clone());
        residual.axpy(-1.0, &shift).unwrap();
        let via_adjoint = system.apply_adjoint(&residual).unwrap();
        let direct = system.gradient(&y).unwrap();
        assert!(via_adjoint.max_abs_diff(&direct) < 1e-10);
    }

    #[test]
    fn test_b2bar_is_loop_residual_at_xbar() {
        let system = preconditioner();
        let mut expected = system.ab2().errors(system.xbar()).unwrap();
        expected.scale(-1.0);
        assert_eq!(system.b2bar(), &expected);
        assert_eq!(system.b2bar().len(), system.ab2().len());
    }

    #[test]
    fn test_tree_without_anchor_is_degenerate() {
        let graph = loop_graph();
        // drop the prior: relative constraints only
        let ab1 = graph.subset(&[1, 2, 3]).unwrap();
        let ab2 = graph.subset(&[4, 5]).unwrap();
        let ordering = Ordering::new(vec![3, 2, 1, 0]).unwrap();
        assert!(matches!(
            SubgraphPreconditioner::from_subgraphs(ab1, ab2, &ordering),
            Err(PcgError::DegenerateSystem(_))
        ));
    }

    #[test]
    fn test_factorization_must_cover_loop_variables() {
        let graph = loop_graph();
        let ab1 = graph.subset(&[0, 1]).unwrap();
        let ab2 = graph.subset(&[2, 3, 4, 5]).unwrap();
        let ordering = Ordering::new(vec![1, 0]).unwrap();
        assert!(matches!(
            SubgraphPreconditioner::from_subgraphs(ab1, ab2, &ordering),
            Err(PcgError::DegenerateSystem(_))
        ));
    }

    #[test]
    fn test_matrix_accessors() {
        let system = preconditioner();
        let ordering = Ordering::new(vec![0, 1, 2, 3]).unwrap();
        let (a1, b1) = system.ab1_matrix(&ordering).unwrap();
        assert_eq!(a1.shape(), (8, 8));
        assert_eq!(b1, system.b1());
        let (a2, _) = system.ab2_matrix(&ordering).unwrap();
        assert_eq!(a2.shape(), (4, 8));
        let a2_sparse = system.a2_sparse(&ordering).unwrap();
        assert_eq!((a2_sparse.nrows(), a2_sparse.ncols()), (4, 8));

        let flat = system.xbar().vector(&ordering).unwrap();
        let rebuilt = system.assemble_config(&flat, &ordering).unwrap();
        assert_eq!(&rebuilt, system.xbar());
        assert!(system.to_string().contains("loops: 2 factors"));
    }
}
