use crate::error::Result;

/// How a solve ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
    /// One of the tolerance tests passed.
    Converged,
    /// Iteration or evaluation budget exhausted.
    MaxIterations,
    /// The callback asked to stop.
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct SolverResult {
    pub status: SolveStatus,
    pub message: String,
    pub params: Vec<f64>,
    /// Cost (`0.5 * sum(r^2)`) at the initial guess
    pub initial_cost: f64,
    pub cost: f64,
    /// Infinity norm of the projected gradient at `params`
    pub optimality: f64,
    pub iterations: u32,
    pub residual_evals: usize,
    pub jacobian_evals: usize,
}

impl SolverResult {
    pub fn success(&self) -> bool {
        self.status == SolveStatus::Converged
    }
}

/// Callback interface for optimization progress
pub trait OptimizationCallback {
    /// Called after every accepted step with the current parameters and cost
    fn on_iteration(&mut self, iteration: u32, params: &[f64], cost: f64) -> Result<()>;

    /// Check if optimization should stop early
    fn should_stop(&self) -> bool {
        false
    }
}

/// A bounded nonlinear least-squares problem.
pub trait Problem {
    /// Residual vector for `params`. Every call may run a full simulation.
    fn residuals(&self, params: &[f64]) -> Result<Vec<f64>>;

    fn num_params(&self) -> usize;

    fn initial_params(&self) -> &[f64];

    /// Parameter bounds (min, max) for each parameter
    fn bounds(&self) -> &[(f64, f64)];
}

/// Solver interface - takes problem and callback
pub trait Solver {
    fn name(&self) -> &str;

    fn solve(
        &mut self,
        problem: &dyn Problem,
        callback: &mut dyn OptimizationCallback,
    ) -> Result<SolverResult>;
}

/// Half the sum of squared residuals.
pub fn cost(residuals: &[f64]) -> f64 {
    0.5 * residuals.iter().map(|r| r * r).sum::<f64>()
}

/// Clamp parameters to bounds
pub fn clamp_params(params: &mut [f64], bounds: &[(f64, f64)]) {
    for (p, &(lo, hi)) in params.iter_mut().zip(bounds.iter()) {
        *p = p.clamp(lo, hi);
    }
}
