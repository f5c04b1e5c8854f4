mod levenberg;
pub mod traits;

pub use levenberg::LevenbergMarquardt;
pub use traits::{
    OptimizationCallback, Problem, SolveStatus, Solver, SolverResult, clamp_params, cost,
};
