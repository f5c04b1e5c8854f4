pub mod callback;
pub mod curve;
pub mod problem;
pub mod solvers;

pub use callback::{FitCallback, IterationResult};
pub use curve::{TargetCurve, interpolate, resample};
pub use problem::CurveFitProblem;
pub use solvers::{
    LevenbergMarquardt, OptimizationCallback, Problem, SolveStatus, Solver, SolverResult,
};
