//! Iterative solvers for linear least squares problems.
//!
//! This module provides:
//! - A conjugate gradient solver generic over any [`LeastSquaresSystem`]
//! - The subgraph-preconditioned driver that splits, eliminates and solves a
//!   linear factor graph
//! - Configuration, status and result types shared by both

use crate::core::{GaussianFactorGraph, VectorConfig};
use crate::error::{PcgError, PcgResult};
use crate::linalg::{SubgraphBuilderConfig, VectorSpace};
use std::fmt;
use std::time::Duration;

pub mod conjugate_gradient;
pub mod subgraph_pcg;

pub use conjugate_gradient::{ConjugateGradient, DenseLeastSquares};
pub use subgraph_pcg::{SolveReport, SubgraphPcg, SubgraphSolution};

/// Least-squares problem `min ½‖A·y - b‖²` seen through its operator pair
///
/// `error` and `gradient` must be consistent: `gradient` is the derivative
/// of `error`, and `apply_adjoint` is the adjoint of `apply`.
pub trait LeastSquaresSystem {
    /// Unknowns
    type Vector: VectorSpace;
    /// Residuals, the range of `apply`
    type Residual: VectorSpace;

    fn error(&self, y: &Self::Vector) -> PcgResult<f64>;

    fn gradient(&self, y: &Self::Vector) -> PcgResult<Self::Vector>;

    /// `A·y`
    fn apply(&self, y: &Self::Vector) -> PcgResult<Self::Residual>;

    /// `Aᵀ·e`
    fn apply_adjoint(&self, e: &Self::Residual) -> PcgResult<Self::Vector>;
}

/// Nonlinear front end that can be linearized around a set of values
pub trait NonlinearSystem {
    /// Linear factor graph in the correction `δ` around `values`
    fn linearize(&self, values: &VectorConfig) -> PcgResult<GaussianFactorGraph>;
}

/// Rule for the next conjugate direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CgDirection {
    /// `β = max(0, ⟨g, g - g_old⟩ / ‖g_old‖²)`
    #[default]
    PolakRibiere,
    /// `β = ‖g‖² / ‖g_old‖²`
    FletcherReeves,
    /// `β = 0`
    SteepestDescent,
}

impl fmt::Display for CgDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgDirection::PolakRibiere => write!(f, "Polak-Ribiere"),
            CgDirection::FletcherReeves => write!(f, "Fletcher-Reeves"),
            CgDirection::SteepestDescent => write!(f, "Steepest descent"),
        }
    }
}

/// Configuration for conjugate gradients and the subgraph driver
#[derive(Debug, Clone, PartialEq)]
pub struct PcgConfig {
    /// Stop once `‖g‖ < rel_tolerance·‖g0‖`
    pub rel_tolerance: f64,
    /// Stop once `‖g‖ < abs_tolerance`
    pub abs_tolerance: f64,
    /// Maximum number of CG steps
    pub max_iterations: usize,
    /// Log every iteration at debug level
    pub verbose: bool,
    pub direction: CgDirection,
    /// Recompute the gradient from scratch every this many steps.
    /// `None` uses `⌊√dim + ½⌋`.
    pub reset_interval: Option<usize>,
    /// Wall-clock budget, checked between steps
    pub timeout: Option<Duration>,
    /// Return non-descent as an error instead of a status
    pub fail_on_non_descent: bool,
    /// Spanning-tree selection for the subgraph driver
    pub tree: SubgraphBuilderConfig,
}

impl Default for PcgConfig {
    fn default() -> Self {
        Self {
            rel_tolerance: 1e-4,
            abs_tolerance: 1e-5,
            max_iterations: 100,
            verbose: false,
            direction: CgDirection::default(),
            reset_interval: None,
            timeout: None,
            fail_on_non_descent: false,
            tree: SubgraphBuilderConfig::default(),
        }
    }
}

impl PcgConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rel_tolerance(mut self, rel_tolerance: f64) -> Self {
        self.rel_tolerance = rel_tolerance;
        self
    }

    pub fn with_abs_tolerance(mut self, abs_tolerance: f64) -> Self {
        self.abs_tolerance = abs_tolerance;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Enable or disable verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_direction(mut self, direction: CgDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_reset_interval(mut self, reset_interval: usize) -> Self {
        self.reset_interval = Some(reset_interval);
        self
    }

    /// Set the timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fail_on_non_descent(mut self, fail: bool) -> Self {
        self.fail_on_non_descent = fail;
        self
    }

    pub fn with_tree(mut self, tree: SubgraphBuilderConfig) -> Self {
        self.tree = tree;
        self
    }

    /// Reject tolerances that are not strictly positive and finite, a zero
    /// iteration cap and a zero reset interval
    pub fn validate(&self) -> PcgResult<()> {
        if !(self.rel_tolerance.is_finite() && self.rel_tolerance > 0.0) {
            return Err(PcgError::InvalidConfig(format!(
                "relative tolerance must be positive, got {}",
                self.rel_tolerance
            )));
        }
        if !(self.abs_tolerance.is_finite() && self.abs_tolerance > 0.0) {
            return Err(PcgError::InvalidConfig(format!(
                "absolute tolerance must be positive, got {}",
                self.abs_tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(PcgError::InvalidConfig(
                "maximum iterations must be at least 1".into(),
            ));
        }
        if self.reset_interval == Some(0) {
            return Err(PcgError::InvalidConfig(
                "gradient reset interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for PcgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PcgConfig {{ rel_tolerance: {:e}, abs_tolerance: {:e}, max_iterations: {}, direction: {}, reset_interval: {:?}, timeout: {:?}, fail_on_non_descent: {}, tree: {:?}, verbose: {} }}",
            self.rel_tolerance,
            self.abs_tolerance,
            self.max_iterations,
            self.direction,
            self.reset_interval,
            self.timeout,
            self.fail_on_non_descent,
            self.tree,
            self.verbose
        )
    }
}

/// How a conjugate gradient run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgStatus {
    /// Gradient norm fell below the relative or absolute tolerance
    Converged { iterations: usize },
    /// Iteration cap or time budget exhausted
    MaxIterationsReached { iterations: usize },
    /// A step failed to decrease the objective; the best iterate is kept
    NonDescentStep { iteration: usize },
}

impl CgStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, CgStatus::Converged { .. })
    }

    /// Completed CG steps
    pub fn iterations(&self) -> usize {
        match *self {
            CgStatus::Converged { iterations } | CgStatus::MaxIterationsReached { iterations } => {
                iterations
            }
            CgStatus::NonDescentStep { iteration } => iteration.saturating_sub(1),
        }
    }
}

impl fmt::Display for CgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgStatus::Converged { iterations } => {
                write!(f, "Converged after {iterations} iterations")
            }
            CgStatus::MaxIterationsReached { iterations } => {
                write!(f, "Maximum iterations reached ({iterations})")
            }
            CgStatus::NonDescentStep { iteration } => {
                write!(f, "Non-descent step at iteration {iteration}")
            }
        }
    }
}

/// Result of a conjugate gradient run
#[derive(Debug, Clone)]
pub struct CgResult<V> {
    /// Best iterate
    pub solution: V,
    pub status: CgStatus,
    /// Completed CG steps
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub initial_gradient_norm: f64,
    pub final_gradient_norm: f64,
    /// Total time elapsed
    pub elapsed: Duration,
}

impl<V> fmt::Display for CgResult<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: error {:.6e} -> {:.6e}, |g| {:.2e} -> {:.2e}, {:.2?}",
            self.status,
            self.initial_error,
            self.final_error,
            self.initial_gradient_norm,
            self.final_gradient_norm,
            self.elapsed
        )
    }
}

/// Stage reached by the subgraph driver
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    #[default]
    Uninitialized,
    /// Spanning tree chosen and graph split
    TreeBuilt,
    /// Tree eliminated and `xbar` computed
    Eliminated,
    /// Preconditioner built, ready for CG
    PreconditionerReady,
    Converged,
    MaxIterationsReached,
    /// Degraded terminal state: CG stopped on a non-descent step
    NonDescentStep,
}

impl SolverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SolverState::Converged | SolverState::MaxIterationsReached | SolverState::NonDescentStep
        )
    }
}

impl From<CgStatus> for SolverState {
    fn from(status: CgStatus) -> Self {
        match status {
            CgStatus::Converged { .. } => SolverState::Converged,
            CgStatus::MaxIterationsReached { .. } => SolverState::MaxIterationsReached,
            CgStatus::NonDescentStep { .. } => SolverState::NonDescentStep,
        }
    }
}

impl fmt::Display for SolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverState::Uninitialized => write!(f, "Uninitialized"),
            SolverState::TreeBuilt => write!(f, "Tree built"),
            SolverState::Eliminated => write!(f, "Eliminated"),
            SolverState::PreconditionerReady => write!(f, "Preconditioner ready"),
            SolverState::Converged => write!(f, "Converged"),
            SolverState::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            SolverState::NonDescentStep => write!(f, "Non-descent step"),
        }
    }
}
