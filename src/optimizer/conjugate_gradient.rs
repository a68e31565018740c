//! Conjugate gradient descent on a linear least-squares system.
//!
//! Works on any [`LeastSquaresSystem`]: the step length is an exact line
//! search through the forward operator, `α = -⟨d, g⟩ / ‖A·d‖²`, and the
//! gradient is updated incrementally as `g += α·Aᵀ(A·d)` with a full
//! recomputation every few steps to flush accumulated roundoff.

use crate::error::{PcgError, PcgResult};
use crate::linalg::VectorSpace;
use crate::optimizer::{CgDirection, CgResult, CgStatus, LeastSquaresSystem, PcgConfig};
use nalgebra::{DMatrix, DVector};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Relative slack before an error increase counts as non-descent
const ERROR_INCREASE_TOLERANCE: f64 = 1e-10;

/// Gradient recomputation period for a problem of `dim` unknowns
pub fn default_reset_interval(dim: usize) -> usize {
    ((dim as f64).sqrt() + 0.5).floor().max(1.0) as usize
}

/// Conjugate gradient solver
#[derive(Debug, Clone, Default)]
pub struct ConjugateGradient {
    config: PcgConfig,
}

impl ConjugateGradient {
    pub fn new(config: PcgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PcgConfig {
        &self.config
    }

    /// Minimize `system.error` starting from `y0`
    ///
    /// Returns the best iterate together with how the run ended. A
    /// non-descent step ends the run with `CgStatus::NonDescentStep`, or with
    /// `PcgError::NonDescentStep` when `fail_on_non_descent` is set.
    pub fn solve<S: LeastSquaresSystem>(
        &self,
        system: &S,
        y0: S::Vector,
    ) -> PcgResult<CgResult<S::Vector>> {
        self.config.validate()?;
        let start = Instant::now();

        let mut y = y0;
        let mut g = system.gradient(&y)?;
        let initial_error = system.error(&y)?;
        let initial_gradient_norm = g.norm();
        let threshold = (self.config.rel_tolerance * initial_gradient_norm)
            .max(self.config.abs_tolerance);
        let reset = self
            .config
            .reset_interval
            .unwrap_or_else(|| default_reset_interval(y.dim()));

        if self.config.verbose {
            debug!(
                "CG start: dim {}, error {:.6e}, |g0| {:.6e}, threshold {:.3e}, reset every {}",
                y.dim(),
                initial_error,
                initial_gradient_norm,
                threshold,
                reset
            );
        }

        let mut error = initial_error;
        let mut gradient_norm = initial_gradient_norm;
        let mut direction = g.clone();
        direction.scale(-1.0);
        let mut iterations = 0;

        let status = loop {
            if gradient_norm < threshold {
                break CgStatus::Converged { iterations };
            }
            if iterations >= self.config.max_iterations {
                break CgStatus::MaxIterationsReached { iterations };
            }
            if let Some(timeout) = self.config.timeout
                && start.elapsed() >= timeout
            {
                debug!("CG time budget of {:?} exhausted after {} iterations", timeout, iterations);
                break CgStatus::MaxIterationsReached { iterations };
            }

            let step = iterations + 1;
            let slope = direction.dot(&g)?;
            if !(slope < 0.0) {
                self.non_descent(step, format!("direction is not a descent direction, <d, g> = {slope:e}"))?;
                break CgStatus::NonDescentStep { iteration: step };
            }
            let ad = system.apply(&direction)?;
            let curvature = ad.squared_norm();
            if !(curvature.is_finite() && curvature > 0.0) {
                self.non_descent(step, format!("curvature |A d|^2 = {curvature:e}"))?;
                break CgStatus::NonDescentStep { iteration: step };
            }

            let alpha = -slope / curvature;
            let mut y_next = y.clone();
            y_next.axpy(alpha, &direction)?;
            let error_next = system.error(&y_next)?;
            if !error_next.is_finite()
                || error_next > error + ERROR_INCREASE_TOLERANCE * error.abs().max(1.0)
            {
                self.non_descent(step, format!("error increased from {error:e} to {error_next:e}"))?;
                break CgStatus::NonDescentStep { iteration: step };
            }

            let g_old = g.clone();
            if step % reset == 0 {
                g = system.gradient(&y_next)?;
            } else {
                g.axpy(alpha, &system.apply_adjoint(&ad)?)?;
            }
            y = y_next;
            error = error_next;
            gradient_norm = g.norm();
            iterations = step;

            if self.config.verbose {
                debug!(
                    "CG iter {:>4}: error {:.6e}, |g| {:.6e}, alpha {:.3e}",
                    iterations, error, gradient_norm, alpha
                );
            }

            let g_old_sq = g_old.squared_norm();
            let beta = match self.config.direction {
                CgDirection::PolakRibiere => {
                    ((g.squared_norm() - g.dot(&g_old)?) / g_old_sq).max(0.0)
                }
                CgDirection::FletcherReeves => g.squared_norm() / g_old_sq,
                CgDirection::SteepestDescent => 0.0,
            };
            direction.scale(beta);
            direction.axpy(-1.0, &g)?;
        };

        let result = CgResult {
            solution: y,
            status,
            iterations,
            initial_error,
            final_error: error,
            initial_gradient_norm,
            final_gradient_norm: gradient_norm,
            elapsed: start.elapsed(),
        };
        if self.config.verbose {
            info!("CG finished. {}", result);
        } else {
            debug!("CG finished. {}", result);
        }
        if matches!(status, CgStatus::MaxIterationsReached { .. }) {
            warn!(
                "CG stopped before convergence: |g| {:.3e} above threshold {:.3e}",
                gradient_norm, threshold
            );
        }
        Ok(result)
    }

    fn non_descent(&self, iteration: usize, detail: String) -> PcgResult<()> {
        if self.config.fail_on_non_descent {
            return Err(PcgError::NonDescentStep { iteration, detail });
        }
        warn!("CG non-descent step at iteration {}: {}", iteration, detail);
        Ok(())
    }
}

/// Dense system `min ½‖A·y - b‖²`
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLeastSquares {
    a: DMatrix<f64>,
    b: DVector<f64>,
}

impl DenseLeastSquares {
    pub fn new(a: DMatrix<f64>, b: DVector<f64>) -> PcgResult<Self> {
        if a.nrows() != b.len() {
            return Err(PcgError::dimension_mismatch("dense system rows", a.nrows(), b.len()));
        }
        Ok(Self { a, b })
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    fn check_columns(&self, y: &DVector<f64>) -> PcgResult<()> {
        if y.len() != self.a.ncols() {
            return Err(PcgError::dimension_mismatch("dense system unknowns", self.a.ncols(), y.len()));
        }
        Ok(())
    }
}

impl LeastSquaresSystem for DenseLeastSquares {
    type Vector = DVector<f64>;
    type Residual = DVector<f64>;

    fn error(&self, y: &DVector<f64>) -> PcgResult<f64> {
        self.check_columns(y)?;
        Ok(0.5 * (&self.a * y - &self.b).norm_squared())
    }

    fn gradient(&self, y: &DVector<f64>) -> PcgResult<DVector<f64>> {
        self.check_columns(y)?;
        Ok(self.a.tr_mul(&(&self.a * y - &self.b)))
    }

    fn apply(&self, y: &DVector<f64>) -> PcgResult<DVector<f64>> {
        self.check_columns(y)?;
        Ok(&self.a * y)
    }

    fn apply_adjoint(&self, e: &DVector<f64>) -> PcgResult<DVector<f64>> {
        if e.len() != self.a.nrows() {
            return Err(PcgError::dimension_mismatch("dense system residual", self.a.nrows(), e.len()));
        }
        Ok(self.a.tr_mul(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_system(rng: &mut StdRng, rows: usize, cols: usize) -> DenseLeastSquares {
        let a = DMatrix::from_fn(rows, cols, |i, j| {
            rng.random_range(-1.0..1.0) + if i == j { 3.0 } else { 0.0 }
        });
        let b = DVector::from_fn(rows, |_, _| rng.random_range(-1.0..1.0));
        DenseLeastSquares::new(a, b).unwrap()
    }

    fn normal_equation_solution(system: &DenseLeastSquares) -> DVector<f64> {
        let ata = system.a().transpose() * system.a();
        let atb = system.a().tr_mul(system.b());
        ata.cholesky().unwrap().solve(&atb)
    }

    fn tight() -> PcgConfig {
        PcgConfig::new()
            .with_rel_tolerance(1e-10)
            .with_abs_tolerance(1e-10)
    }

    #[test]
    fn test_default_reset_interval() {
        assert_eq!(default_reset_interval(0), 1);
        assert_eq!(default_reset_interval(1), 1);
        assert_eq!(default_reset_interval(6), 2);
        assert_eq!(default_reset_interval(7), 3);
        assert_eq!(default_reset_interval(100), 10);
    }

    #[test]
    fn test_dense_system_matches_normal_equations() {
        let mut rng = StdRng::seed_from_u64(42);
        let system = random_system(&mut rng, 12, 8);
        let result = ConjugateGradient::new(tight())
            .solve(&system, DVector::zeros(8))
            .unwrap();
        assert!(result.status.is_converged(), "{}", result.status);
        let expected = normal_equation_solution(&system);
        assert!((&result.solution - expected).amax() < 1e-8);
        assert!(result.final_error <= result.initial_error);
    }

    #[test]
    fn test_all_directions_converge() {
        let mut rng = StdRng::seed_from_u64(9);
        let system = random_system(&mut rng, 10, 6);
        let expected = normal_equation_solution(&system);
        for direction in [
            CgDirection::PolakRibiere,
            CgDirection::FletcherReeves,
            CgDirection::SteepestDescent,
        ] {
            let config = tight().with_direction(direction).with_max_iterations(2000);
            let result = ConjugateGradient::new(config)
                .solve(&system, DVector::zeros(6))
                .unwrap();
            assert!(result.status.is_converged(), "{direction}: {}", result.status);
            assert!((&result.solution - &expected).amax() < 1e-6, "{direction}");
        }
    }

    #[test]
    fn test_stationary_start_takes_no_steps() {
        let system = DenseLeastSquares::new(
            DMatrix::identity(3, 3),
            DVector::from_vec(vec![1.0, 2.0, 3.0]),
        )
        .unwrap();
        let result = ConjugateGradient::default()
            .solve(&system, DVector::from_vec(vec![1.0, 2.0, 3.0]))
            .unwrap();
        assert_eq!(result.status, CgStatus::Converged { iterations: 0 });
        assert_eq!(result.iterations, 0);
        assert_eq!(result.final_error, 0.0);
    }

    #[test]
    fn test_iteration_cap() {
        let mut rng = StdRng::seed_from_u64(1);
        let system = random_system(&mut rng, 20, 20);
        let config = tight().with_max_iterations(2);
        let result = ConjugateGradient::new(config)
            .solve(&system, DVector::zeros(20))
            .unwrap();
        assert_eq!(result.status, CgStatus::MaxIterationsReached { iterations: 2 });
        assert!(result.final_error < result.initial_error);
    }

    #[test]
    fn test_zero_timeout_stops_immediately() {
        let mut rng = StdRng::seed_from_u64(2);
        let system = random_system(&mut rng, 5, 5);
        let config = tight().with_timeout(std::time::Duration::ZERO);
        let result = ConjugateGradient::new(config)
            .solve(&system, DVector::zeros(5))
            .unwrap();
        assert_eq!(result.status, CgStatus::MaxIterationsReached { iterations: 0 });
    }

    /// Gradient that points the wrong way
    struct Uphill(DenseLeastSquares);

    impl LeastSquaresSystem for Uphill {
        type Vector = DVector<f64>;
        type Residual = DVector<f64>;

        fn error(&self, y: &DVector<f64>) -> PcgResult<f64> {
            self.0.error(y)
        }

        fn gradient(&self, y: &DVector<f64>) -> PcgResult<DVector<f64>> {
            Ok(-self.0.gradient(y)?)
        }

        fn apply(&self, y: &DVector<f64>) -> PcgResult<DVector<f64>> {
            self.0.apply(y)
        }

        fn apply_adjoint(&self, e: &DVector<f64>) -> PcgResult<DVector<f64>> {
            self.0.apply_adjoint(e)
        }
    }

    #[test]
    fn test_non_descent_keeps_best_iterate() {
        let system = Uphill(
            DenseLeastSquares::new(DMatrix::identity(2, 2), DVector::from_vec(vec![1.0, -1.0]))
                .unwrap(),
        );
        let y0 = DVector::zeros(2);
        let result = ConjugateGradient::default().solve(&system, y0.clone()).unwrap();
        assert_eq!(result.status, CgStatus::NonDescentStep { iteration: 1 });
        assert_eq!(result.solution, y0);
        assert_eq!(result.final_error, result.initial_error);
    }

    #[test]
    fn test_non_descent_as_error() {
        let system = Uphill(
            DenseLeastSquares::new(DMatrix::identity(2, 2), DVector::from_vec(vec![1.0, -1.0]))
                .unwrap(),
        );
        let config = PcgConfig::new().with_fail_on_non_descent(true);
        let result = ConjugateGradient::new(config).solve(&system, DVector::zeros(2));
        assert!(matches!(
            result,
            Err(PcgError::NonDescentStep { iteration: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let system =
            DenseLeastSquares::new(DMatrix::identity(2, 2), DVector::zeros(2)).unwrap();
        let result = ConjugateGradient::new(PcgConfig::new().with_max_iterations(0))
            .solve(&system, DVector::zeros(2));
        assert!(matches!(result, Err(PcgError::InvalidConfig(_))));
    }

    #[test]
    fn test_runs_are_deterministic() {
        let mut rng = StdRng::seed_from_u64(77);
        let system = random_system(&mut rng, 15, 10);
        let cg = ConjugateGradient::new(PcgConfig::new().with_max_iterations(5));
        let first = cg.solve(&system, DVector::zeros(10)).unwrap();
        let second = cg.solve(&system, DVector::zeros(10)).unwrap();
        assert_eq!(first.solution, second.solution);
        assert_eq!(first.status, second.status);
    }
}
