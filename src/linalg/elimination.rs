//! Sequential QR elimination of a linear factor graph.
//!
//! Variables are eliminated one at a time in the given ordering. For each
//! variable, every remaining factor touching it is stacked into a dense
//! `[A_j | A_sep | b]`, and a Householder QR splits the result into a
//! conditional on the variable and a new factor on its separator. On a
//! spanning tree eliminated leaves-to-root the separators are single parent
//! variables, so no fill-in appears.

use crate::core::{GaussianFactorGraph, JacobianFactor, Key, Ordering};
use crate::error::{PcgError, PcgResult};
use crate::linalg::{GaussianBayesNet, GaussianConditional};
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Eliminate every variable of `graph` in `ordering`
///
/// Fails with `DegenerateSystem` when a variable has no factor, fewer rows
/// than unknowns, or a zero pivot, i.e. whenever the graph does not pin down
/// every variable.
pub fn eliminate(graph: &GaussianFactorGraph, ordering: &Ordering) -> PcgResult<GaussianBayesNet> {
    let dims = graph.dims()?;
    for key in dims.keys() {
        if !ordering.contains(*key) {
            return Err(PcgError::InvalidInput(format!(
                "Ordering does not contain variable x{key}"
            )));
        }
    }

    let mut factors: Vec<Option<JacobianFactor>> = graph.factors().iter().cloned().map(Some).collect();
    let mut variable_index: HashMap<Key, Vec<usize>> = HashMap::new();
    for (i, factor) in graph.factors().iter().enumerate() {
        for key in factor.keys() {
            variable_index.entry(key).or_default().push(i);
        }
    }

    let mut conditionals = Vec::with_capacity(ordering.len());
    for key in ordering.iter() {
        let involved: Vec<JacobianFactor> = variable_index
            .remove(&key)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|i| factors[i].take())
            .collect();
        let dim = *dims.get(&key).ok_or_else(|| {
            PcgError::DegenerateSystem(format!("x{key} is not constrained by any factor"))
        })?;
        if involved.is_empty() {
            return Err(PcgError::DegenerateSystem(format!(
                "x{key} has no remaining factor when eliminated"
            )));
        }

        let (conditional, remaining) = eliminate_one(key, dim, &involved, &dims, ordering)?;
        trace!(
            "eliminated x{} from {} factors, separator size {}",
            key,
            involved.len(),
            conditional.parents().len()
        );
        conditionals.push(conditional);

        if let Some(factor) = remaining {
            let index = factors.len();
            for separator in factor.keys() {
                variable_index.entry(separator).or_default().push(index);
            }
            factors.push(Some(factor));
        }
    }

    GaussianBayesNet::from_conditionals(conditionals)
}

/// Eliminate `key` from the stacked `factors`, returning its conditional and
/// the factor left on the separator
fn eliminate_one(
    key: Key,
    dim: usize,
    factors: &[JacobianFactor],
    dims: &BTreeMap<Key, usize>,
    ordering: &Ordering,
) -> PcgResult<(GaussianConditional, Option<JacobianFactor>)> {
    // Separator in elimination order so parents line up with later conditionals
    let mut separator: Vec<Key> = factors
        .iter()
        .flat_map(|f| f.keys())
        .filter(|&k| k != key)
        .collect();
    separator.sort_by_key(|&k| ordering.position(k).unwrap_or(usize::MAX));
    separator.dedup();

    let mut offsets = Vec::with_capacity(separator.len());
    let mut ncols = dim;
    for &k in &separator {
        offsets.push(ncols);
        ncols += dims[&k];
    }
    let column_of = |k: Key| -> usize {
        if k == key {
            0
        } else {
            let i = separator.iter().position(|&s| s == k).unwrap_or(0);
            offsets[i]
        }
    };

    let nrows: usize = factors.iter().map(|f| f.rows()).sum();
    if nrows < dim {
        return Err(PcgError::DegenerateSystem(format!(
            "x{key} has {nrows} constraint rows for {dim} unknowns"
        )));
    }

    let mut ab = DMatrix::<f64>::zeros(nrows, ncols + 1);
    let mut row = 0;
    for factor in factors {
        for (k, block) in factor.terms() {
            ab.view_mut((row, column_of(*k)), block.shape())
                .copy_from(block);
        }
        ab.view_mut((row, ncols), (factor.rows(), 1))
            .copy_from(factor.b());
        row += factor.rows();
    }

    let r = ab.qr().r();

    let frontal = r.view((0, 0), (dim, dim)).into_owned();
    let parents: Vec<(Key, DMatrix<f64>)> = separator
        .iter()
        .zip(&offsets)
        .map(|(&k, &col)| (k, r.view((0, col), (dim, dims[&k])).into_owned()))
        .collect();
    let d = DVector::from_iterator(dim, r.view((0, ncols), (dim, 1)).iter().copied());
    let conditional = GaussianConditional::new(key, frontal, parents, d)?;

    // Rows past the separator width only carry the unexplained residual
    let remaining_rows = nrows.min(ncols).saturating_sub(dim);
    let remaining = if separator.is_empty() || remaining_rows == 0 {
        None
    } else {
        let terms = separator
            .iter()
            .zip(&offsets)
            .map(|(&k, &col)| (k, r.view((dim, col), (remaining_rows, dims[&k])).into_owned()))
            .collect();
        let b = DVector::from_iterator(
            remaining_rows,
            r.view((dim, ncols), (remaining_rows, 1)).iter().copied(),
        );
        Some(JacobianFactor::new(terms, b)?)
    };

    Ok((conditional, remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VectorConfig;
    use crate::linalg::VectorSpace;

    fn scalar(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    /// prior x0 = 1, x1 - x0 = 2, x2 - x1 = 3
    fn chain() -> GaussianFactorGraph {
        GaussianFactorGraph::from_factors(vec![
            JacobianFactor::unary(0, scalar(1.0), DVector::from_vec(vec![1.0])).unwrap(),
            JacobianFactor::binary(0, scalar(-1.0), 1, scalar(1.0), DVector::from_vec(vec![2.0]))
                .unwrap(),
            JacobianFactor::binary(1, scalar(-1.0), 2, scalar(1.0), DVector::from_vec(vec![3.0]))
                .unwrap(),
        ])
    }

    #[test]
    fn test_chain_solution() {
        let graph = chain();
        let ordering = Ordering::new(vec![2, 1, 0]).unwrap();
        let net = eliminate(&graph, &ordering).unwrap();
        assert_eq!(net.len(), 3);
        let x = net.solve().unwrap();
        assert!((x.get(0).unwrap()[0] - 1.0).abs() < 1e-12);
        assert!((x.get(1).unwrap()[0] - 3.0).abs() < 1e-12);
        assert!((x.get(2).unwrap()[0] - 6.0).abs() < 1e-12);
        assert!(graph.squared_error(&x).unwrap() < 1e-20);
    }

    #[test]
    fn test_leaves_first_ordering_has_no_fill_in() {
        let graph = chain();
        let ordering = Ordering::new(vec![2, 1, 0]).unwrap();
        let net = eliminate(&graph, &ordering).unwrap();
        for conditional in net.conditionals() {
            assert!(conditional.parents().len() <= 1);
        }
    }

    #[test]
    fn test_overdetermined_matches_dense_least_squares() {
        let mut graph = chain();
        graph.add(
            JacobianFactor::binary(0, scalar(-1.0), 2, scalar(1.0), DVector::from_vec(vec![4.5]))
                .unwrap(),
        );
        let ordering = Ordering::new(vec![0, 1, 2]).unwrap();
        let x = eliminate(&graph, &ordering).unwrap().solve().unwrap();

        let (a, b) = graph.matrix(&ordering).unwrap();
        let ata = a.transpose() * &a;
        let atb = a.transpose() * &b;
        let expected = ata.cholesky().unwrap().solve(&atb);
        let expected = graph.assemble_config(&expected, &ordering).unwrap();
        assert!(x.max_abs_diff(&expected) < 1e-10);
    }

    #[test]
    fn test_factorization_reproduces_normal_equations() {
        // RᵀR = AᵀA for the stacked triangular factor
        let mut graph = chain();
        graph.add(
            JacobianFactor::binary(0, scalar(-2.0), 2, scalar(0.5), DVector::from_vec(vec![1.0]))
                .unwrap(),
        );
        let ordering = Ordering::new(vec![1, 0, 2]).unwrap();
        let net = eliminate(&graph, &ordering).unwrap();
        let probe = VectorConfig::new()
            .with(0, DVector::from_vec(vec![0.3]))
            .with(1, DVector::from_vec(vec![-0.7]))
            .with(2, DVector::from_vec(vec![1.1]));
        let r_probe = net.multiply(&probe).unwrap();
        let a_probe = graph.multiply(&probe).unwrap();
        assert!((r_probe.squared_norm() - a_probe.squared_norm()).abs() < 1e-12);
    }

    #[test]
    fn test_gauge_freedom_is_degenerate() {
        // Relative constraints only: the absolute position is free
        let graph = GaussianFactorGraph::from_factors(vec![
            JacobianFactor::binary(0, scalar(-1.0), 1, scalar(1.0), DVector::from_vec(vec![1.0]))
                .unwrap(),
        ]);
        let ordering = Ordering::new(vec![1, 0]).unwrap();
        assert!(matches!(
            eliminate(&graph, &ordering),
            Err(PcgError::DegenerateSystem(_))
        ));
    }

    #[test]
    fn test_unconstrained_ordering_key_is_degenerate() {
        let graph = chain();
        let ordering = Ordering::new(vec![2, 1, 0, 7]).unwrap();
        assert!(matches!(
            eliminate(&graph, &ordering),
            Err(PcgError::DegenerateSystem(_))
        ));
    }
}
