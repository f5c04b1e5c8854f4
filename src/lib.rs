pub mod core;
pub mod error;
pub mod optimization;
pub mod optimizer;
pub mod simulation;

pub use crate::core::{
    BoundRepair, Component, ComponentKind, Constraint, ConstraintKind, ConstraintSet,
    NodeBound, NodeBounds, RelationshipType, Tolerances, ValueUpdate, format_value, parse_value,
};
pub use error::{Error, Result, SimulatorError};
pub use optimization::{LevenbergMarquardt, SolveStatus, TargetCurve};
pub use optimizer::{
    OptimizationHandle, OptimizationRequest, OptimizationSummary, Optimizer, OptimizerConfig,
    Progress, ProgressEvent, SolveState, run_optimization,
};
pub use simulation::{Netlist, SimulationResult, Simulator, SimulatorConfig, XyceRunner};
