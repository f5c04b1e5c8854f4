use log::debug;
use nalgebra::{DMatrix, DVector};

use super::traits::{
    OptimizationCallback, Problem, SolveStatus, Solver, SolverResult, clamp_params, cost,
};
use crate::core::Tolerances;
use crate::error::{Error, Result};

/// Bounded Levenberg-Marquardt with finite-difference Jacobians.
///
/// Steps solve `(JᵀJ + λ·diag(JᵀJ)) δ = -Jᵀr` and are projected onto the
/// bounds. Terminates on `xtol` (relative step), `ftol` (relative cost
/// reduction) or `gtol` (projected gradient infinity norm).
pub struct LevenbergMarquardt {
    max_iter: u32,
    max_evaluations: Option<usize>,
    tolerances: Tolerances,
    initial_damping: f64,
    min_gain: f64, // Gain ratio below which a step is rejected
}

impl LevenbergMarquardt {
    pub fn new(max_iter: u32, tolerances: Tolerances) -> Self {
        Self {
            max_iter,
            max_evaluations: None,
            tolerances,
            initial_damping: 1e-3,
            min_gain: 1e-4,
        }
    }

    pub fn with_max_evaluations(mut self, max_evaluations: Option<usize>) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    pub fn with_initial_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    fn budget_spent(&self, evals: usize) -> bool {
        self.max_evaluations.is_some_and(|max| evals >= max)
    }

    /// Column-wise finite-difference Jacobian.
    ///
    /// Central differences where both neighbours fit in the bounds, one-sided
    /// otherwise; a column whose range is a single point is zero.
    fn jacobian(
        &self,
        problem: &dyn Problem,
        x: &[f64],
        r: &[f64],
        evals: &mut usize,
    ) -> Result<DMatrix<f64>> {
        let bounds = problem.bounds();
        let rel_step = f64::EPSILON.cbrt();
        let mut jac = DMatrix::zeros(r.len(), x.len());

        for j in 0..x.len() {
            let (lo, hi) = bounds[j];
            let mut h = rel_step * if x[j] != 0.0 { x[j].abs() } else { 1.0 };
            if hi - lo <= 0.0 {
                continue;
            }
            h = h.min(0.5 * (hi - lo));

            let mut probe = x.to_vec();
            let column: Vec<f64> = if x[j] - h >= lo && x[j] + h <= hi {
                probe[j] = x[j] + h;
                let plus = problem.residuals(&probe)?;
                probe[j] = x[j] - h;
                let minus = problem.residuals(&probe)?;
                *evals += 2;
                plus.iter()
                    .zip(&minus)
                    .map(|(p, m)| (p - m) / (2.0 * h))
                    .collect()
            } else {
                let step = if x[j] + h <= hi { h } else { -h };
                probe[j] = x[j] + step;
                let shifted = problem.residuals(&probe)?;
                *evals += 1;
                shifted.iter().zip(r).map(|(s, r0)| (s - r0) / step).collect()
            };

            if column.len() != r.len() {
                return Err(Error::CurveData(format!(
                    "residual length changed from {} to {}",
                    r.len(),
                    column.len()
                )));
            }
            jac.set_column(j, &DVector::from_vec(column));
        }

        Ok(jac)
    }
}

/// Infinity norm of the gradient with components that push into an active bound removed.
fn projected_gradient_norm(x: &[f64], g: &DVector<f64>, bounds: &[(f64, f64)]) -> f64 {
    x.iter()
        .zip(g.iter())
        .zip(bounds)
        .map(|((&xi, &gi), &(lo, hi))| {
            if (xi <= lo && gi > 0.0) || (xi >= hi && gi < 0.0) {
                0.0
            } else {
                gi.abs()
            }
        })
        .fold(0.0, f64::max)
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

impl Solver for LevenbergMarquardt {
    fn name(&self) -> &str {
        "LevenbergMarquardt"
    }

    fn solve(
        &mut self,
        problem: &dyn Problem,
        callback: &mut dyn OptimizationCallback,
    ) -> Result<SolverResult> {
        let n = problem.num_params();
        if n == 0 {
            return Err(Error::NoVariables);
        }
        let bounds = problem.bounds();
        let tol = self.tolerances;

        let mut x = problem.initial_params().to_vec();
        clamp_params(&mut x, bounds);

        let mut r = problem.residuals(&x)?;
        let mut residual_evals = 1;
        let mut jacobian_evals = 0;
        if r.is_empty() {
            return Err(Error::CurveData("residual vector is empty".into()));
        }
        let initial_cost = cost(&r);
        let mut current = initial_cost;

        let mut lambda = self.initial_damping;
        let mut nu = 2.0;
        let mut iterations = 0;

        let mut jac = self.jacobian(problem, &x, &r, &mut residual_evals)?;
        jacobian_evals += 1;

        let (status, message, optimality) = loop {
            let residual = DVector::from_column_slice(&r);
            let g = jac.transpose() * &residual;
            let optimality = projected_gradient_norm(&x, &g, bounds);

            if optimality <= tol.gtol {
                break (
                    SolveStatus::Converged,
                    "`gtol` termination condition is satisfied".to_string(),
                    optimality,
                );
            }
            if callback.should_stop() {
                break (SolveStatus::Cancelled, "Stopped by callback".into(), optimality);
            }
            if iterations >= self.max_iter || self.budget_spent(residual_evals) {
                break (
                    SolveStatus::MaxIterations,
                    "The maximum number of function evaluations is exceeded".into(),
                    optimality,
                );
            }
            iterations += 1;

            let jtj = jac.transpose() * &jac;
            let scale_floor = 1e-12 * jtj.diagonal().amax().max(1.0);
            let mut lhs = jtj.clone();
            for i in 0..n {
                lhs[(i, i)] += lambda * jtj[(i, i)].max(scale_floor);
            }

            let Some(chol) = lhs.cholesky() else {
                lambda *= nu;
                nu *= 2.0;
                continue;
            };
            let delta = chol.solve(&(-&g));

            let mut candidate: Vec<f64> = x.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
            clamp_params(&mut candidate, bounds);
            let step: Vec<f64> = candidate.iter().zip(&x).map(|(c, a)| c - a).collect();

            if norm(&step) <= tol.xtol * (tol.xtol + norm(&x)) {
                break (
                    SolveStatus::Converged,
                    "`xtol` termination condition is satisfied".into(),
                    optimality,
                );
            }

            let trial = problem.residuals(&candidate)?;
            residual_evals += 1;
            let trial_cost = cost(&trial);

            // Predicted decrease of the local quadratic model along the projected step
            let s = DVector::from_vec(step);
            let predicted = -(g.dot(&s) + 0.5 * s.dot(&(&jtj * &s)));
            let actual = current - trial_cost;
            let gain = if predicted > 0.0 { actual / predicted } else { -1.0 };

            debug!(
                "LM iter {}: cost {:.6e} -> {:.6e}, gain {:.3}, lambda {:.3e}",
                iterations, current, trial_cost, gain, lambda
            );

            if gain > self.min_gain {
                let previous = current;
                x = candidate;
                r = trial;
                current = trial_cost;
                lambda *= (1.0_f64 / 3.0).max(1.0 - (2.0 * gain - 1.0).powi(3));
                nu = 2.0;

                callback.on_iteration(iterations, &x, current)?;

                if actual <= tol.ftol * previous {
                    let g = jac.transpose() * DVector::from_column_slice(&r);
                    break (
                        SolveStatus::Converged,
                        "`ftol` termination condition is satisfied".into(),
                        projected_gradient_norm(&x, &g, bounds),
                    );
                }

                if self.budget_spent(residual_evals) {
                    continue;
                }
                jac = self.jacobian(problem, &x, &r, &mut residual_evals)?;
                jacobian_evals += 1;
            } else {
                lambda *= nu;
                nu *= 2.0;
            }
        };

        Ok(SolverResult {
            status,
            message,
            params: x,
            initial_cost,
            cost: current,
            optimality,
            iterations,
            residual_evals,
            jacobian_evals,
        })
    }
}
