//! Subgraph-preconditioned conjugate gradient driver.
//!
//! One solve runs through a fixed sequence of stages:
//! 1. pick a spanning tree, split the graph into `Ab1` and `Ab2`
//! 2. eliminate `Ab1` leaves-to-root into `R1·x = c1` and back-substitute `xbar`
//! 3. build the preconditioned system in `y = R1·(x - xbar)`
//! 4. run conjugate gradients from `y = 0`
//! 5. map the result back to `x = xbar + R1⁻¹·ŷ`
//!
//! Structural failures (disconnected or degenerate graphs) are returned as
//! errors and never retried; [`SubgraphPcg::state`] records the last stage
//! that completed.

use crate::core::{GaussianFactorGraph, Ordering, VectorConfig};
use crate::error::PcgResult;
use crate::linalg::{Subgraph, SubgraphBuilder, SubgraphPreconditioner};
use crate::optimizer::{
    CgResult, ConjugateGradient, NonlinearSystem, PcgConfig, SolverState,
};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Solution of one preconditioned solve
#[derive(Debug, Clone)]
pub struct SubgraphSolution {
    /// `x(ŷ)`
    pub x: VectorConfig,
    /// Conjugate gradient outcome in the transformed variable `y`
    pub cg: CgResult<VectorConfig>,
}

/// Full report of [`SubgraphPcg::solve`]
#[derive(Debug, Clone)]
pub struct SolveReport {
    /// Terminal state reached
    pub state: SolverState,
    /// Elimination ordering of the spanning tree
    pub ordering: Ordering,
    pub tree_factors: usize,
    pub loop_factors: usize,
    pub solution: SubgraphSolution,
    /// Total time elapsed, including tree selection and elimination
    pub elapsed: Duration,
}

impl fmt::Display for SolveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Subgraph PCG: {}", self.state)?;
        writeln!(
            f,
            "  tree: {} factors, loops: {} factors",
            self.tree_factors, self.loop_factors
        )?;
        writeln!(f, "  {}", self.ordering)?;
        writeln!(f, "  {}", self.solution.cg)?;
        write!(f, "  total time: {:.2?}", self.elapsed)
    }
}

/// Subgraph-preconditioned conjugate gradient solver
#[derive(Debug, Clone, Default)]
pub struct SubgraphPcg {
    config: PcgConfig,
    state: SolverState,
}

impl SubgraphPcg {
    /// Create a new solver with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new solver with the given configuration
    pub fn with_config(config: PcgConfig) -> Self {
        Self {
            config,
            state: SolverState::Uninitialized,
        }
    }

    pub fn config(&self) -> &PcgConfig {
        &self.config
    }

    /// Last stage reached by the most recent call
    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Split, eliminate and precondition `graph`
    pub fn linearize(&mut self, graph: &GaussianFactorGraph) -> PcgResult<SubgraphPreconditioner> {
        self.build(graph).map(|(_, system)| system)
    }

    /// Run conjugate gradients on a prepared system from `y = 0`
    pub fn optimize(&mut self, system: &SubgraphPreconditioner) -> PcgResult<SubgraphSolution> {
        let cg = ConjugateGradient::new(self.config.clone()).solve(system, system.zero_y())?;
        let x = system.x(&cg.solution)?;
        self.state = cg.status.into();
        Ok(SubgraphSolution { x, cg })
    }

    /// Solve the linear least-squares problem `graph` end to end
    pub fn solve(&mut self, graph: &GaussianFactorGraph) -> PcgResult<SolveReport> {
        let start = Instant::now();
        let (subgraph, system) = self.build(graph)?;
        let solution = self.optimize(&system)?;

        let report = SolveReport {
            state: self.state,
            ordering: subgraph.ordering,
            tree_factors: subgraph.tree.len(),
            loop_factors: subgraph.loops.len(),
            solution,
            elapsed: start.elapsed(),
        };
        if self.config.verbose {
            info!("{}", report);
        }
        Ok(report)
    }

    /// Linearize `system` at `values` and return the correction `δ`
    pub fn optimize_step<N: NonlinearSystem>(
        &mut self,
        system: &N,
        values: &VectorConfig,
    ) -> PcgResult<VectorConfig> {
        self.state = SolverState::Uninitialized;
        let graph = system.linearize(values)?;
        Ok(self.solve(&graph)?.solution.x)
    }

    fn build(
        &mut self,
        graph: &GaussianFactorGraph,
    ) -> PcgResult<(Subgraph, SubgraphPreconditioner)> {
        self.state = SolverState::Uninitialized;
        self.config.validate()?;

        let subgraph = SubgraphBuilder::new(self.config.tree).build(graph)?;
        let (ab1, ab2) = subgraph.split(graph)?;
        self.state = SolverState::TreeBuilt;
        debug!("{}", subgraph);

        let rc1 = ab1.eliminate(&subgraph.ordering)?;
        let xbar = rc1.solve()?;
        self.state = SolverState::Eliminated;

        let system = SubgraphPreconditioner::new(ab1, ab2, rc1, xbar)?;
        self.state = SolverState::PreconditionerReady;
        if self.config.verbose {
            debug!("{}", system);
        }
        Ok((subgraph, system))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JacobianFactor;
    use crate::error::PcgError;
    use nalgebra::{DMatrix, DVector};

    fn scalar(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    fn between(a: usize, b: usize, z: f64) -> JacobianFactor {
        JacobianFactor::binary(a, scalar(-1.0), b, scalar(1.0), DVector::from_vec(vec![z])).unwrap()
    }

    /// prior x0 = 0, odometry 1.0 twice, loop closure x2 - x0 = 2.3
    fn triangle() -> GaussianFactorGraph {
        GaussianFactorGraph::from_factors(vec![
            JacobianFactor::unary(0, scalar(1.0), DVector::from_vec(vec![0.0])).unwrap(),
            between(0, 1, 1.0),
            between(1, 2, 1.0),
            between(0, 2, 2.3),
        ])
    }

    #[test]
    fn test_states_advance_through_solve() {
        let mut solver = SubgraphPcg::new();
        assert_eq!(solver.state(), SolverState::Uninitialized);
        let system = solver.linearize(&triangle()).unwrap();
        assert_eq!(solver.state(), SolverState::PreconditionerReady);
        let solution = solver.optimize(&system).unwrap();
        assert_eq!(solver.state(), SolverState::Converged);
        assert!(solution.cg.status.is_converged());
    }

    #[test]
    fn test_report_carries_ordering_and_split() {
        let report = SubgraphPcg::new().solve(&triangle()).unwrap();
        assert_eq!(report.tree_factors, 3);
        assert_eq!(report.loop_factors, 1);
        assert_eq!(report.ordering.keys(), &[2, 1, 0]);
        assert_eq!(report.state, SolverState::Converged);
        assert!(report.to_string().contains("loops: 1 factors"));
    }

    #[test]
    fn test_disconnected_graph_stops_before_tree() {
        let mut graph = triangle();
        graph.add(JacobianFactor::unary(5, scalar(1.0), DVector::from_vec(vec![1.0])).unwrap());
        let mut solver = SubgraphPcg::new();
        assert_eq!(
            solver.solve(&graph).unwrap_err(),
            PcgError::DisconnectedGraph { components: 2 }
        );
        assert_eq!(solver.state(), SolverState::Uninitialized);
    }

    #[test]
    fn test_missing_anchor_stops_after_tree() {
        let graph = GaussianFactorGraph::from_factors(vec![between(0, 1, 1.0), between(1, 2, 1.0)]);
        let mut solver = SubgraphPcg::new();
        assert!(matches!(
            solver.solve(&graph),
            Err(PcgError::DegenerateSystem(_))
        ));
        assert_eq!(solver.state(), SolverState::TreeBuilt);
    }

    #[test]
    fn test_invalid_config_rejected_before_work() {
        let mut solver = SubgraphPcg::with_config(PcgConfig::new().with_abs_tolerance(-1.0));
        assert!(matches!(
            solver.solve(&triangle()),
            Err(PcgError::InvalidConfig(_))
        ));
        assert_eq!(solver.state(), SolverState::Uninitialized);
    }

    /// `x_i` should sit at `targets[i]`, with relative measurements between neighbours
    struct LineSystem {
        targets: Vec<f64>,
    }

    impl NonlinearSystem for LineSystem {
        fn linearize(&self, values: &VectorConfig) -> PcgResult<GaussianFactorGraph> {
            let value = |k: usize| values.try_get(k).map(|v| v[0]);
            let mut graph = GaussianFactorGraph::new();
            graph.add(JacobianFactor::unary(
                0,
                scalar(1.0),
                DVector::from_vec(vec![self.targets[0] - value(0)?]),
            )?);
            for k in 1..self.targets.len() {
                let z = self.targets[k] - self.targets[k - 1];
                let predicted = value(k)? - value(k - 1)?;
                graph.add(JacobianFactor::binary(
                    k - 1,
                    scalar(-1.0),
                    k,
                    scalar(1.0),
                    DVector::from_vec(vec![z - predicted]),
                )?);
            }
            Ok(graph)
        }
    }

    #[test]
    fn test_optimize_step_returns_correction() {
        let system = LineSystem {
            targets: vec![0.5, 1.5, 4.0],
        };
        let values: VectorConfig = (0..3).map(|k| (k, DVector::from_vec(vec![0.0]))).collect();
        let config = PcgConfig::new().with_rel_tolerance(1e-12).with_abs_tolerance(1e-12);
        let delta = SubgraphPcg::with_config(config)
            .optimize_step(&system, &values)
            .unwrap();
        let updated = values.add(&delta).unwrap();
        for (k, target) in system.targets.iter().enumerate() {
            assert!((updated.get(k).unwrap()[0] - target).abs() < 1e-10);
        }
    }
}
