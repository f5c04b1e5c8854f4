pub mod config;
pub mod progress;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;
use log::{error, info, warn};

pub use config::OptimizerConfig;
pub use progress::{OptimizationSummary, Progress, ProgressEvent, SolveState};

use crate::core::{
    ClassifiedConstraint, ConstraintSet, EqualityConstraint, NodeBounds,
    apply_parameter_constraints, build_node_bounds, classify, detect_cycle, normalize_probe,
};
use crate::error::{Error, Result};
use crate::optimization::{
    CurveFitProblem, FitCallback, LevenbergMarquardt, SolveStatus, Solver, TargetCurve,
};
use crate::simulation::{Netlist, Simulator, TransientSpec, XyceRunner, inject_transient_directive};

/// Everything one solve needs once the working netlist is in place.
pub struct OptimizationRequest {
    pub netlist: Netlist,
    /// Writable copy that every residual evaluation patches and simulates
    pub working_path: PathBuf,
    pub target: TargetCurve,
    /// Output column compared against the target, e.g. `V(out)`
    pub target_column: String,
    pub node_bounds: NodeBounds,
    pub equalities: Vec<EqualityConstraint>,
    pub config: OptimizerConfig,
}

/// Fit the variable components of a prepared working netlist.
///
/// Emits `Validating`, `Running` and one terminal outcome on `progress`.
/// On success the working file holds the final values.
pub fn run_optimization(
    request: OptimizationRequest,
    simulator: &dyn Simulator,
    progress: &Progress,
    cancel: Arc<AtomicBool>,
) -> Result<OptimizationSummary> {
    progress.emit(ProgressEvent::State(SolveState::Validating));
    solve(request, simulator, progress, cancel)
}

fn solve(
    request: OptimizationRequest,
    simulator: &dyn Simulator,
    progress: &Progress,
    cancel: Arc<AtomicBool>,
) -> Result<OptimizationSummary> {
    let OptimizationRequest {
        netlist,
        working_path,
        target,
        target_column,
        node_bounds,
        equalities,
        config,
    } = request;

    let problem = CurveFitProblem::new(netlist, &working_path, simulator, target, &target_column)
        .map_err(|e| fail(progress, e))?
        .with_node_bounds(node_bounds)
        .with_equalities(equalities)
        .with_penalty(config.penalty)
        .with_counter_interval(config.counter_interval)
        .with_progress(progress.clone())
        .with_cancel_flag(cancel.clone());

    progress.emit(ProgressEvent::State(SolveState::Running));
    info!(
        "fitting {} to target over {} variable(s): {}",
        target_column,
        problem.names().len(),
        problem.names().join(", ")
    );

    let mut solver = LevenbergMarquardt::new(config.max_iterations, config.tolerances)
        .with_max_evaluations(config.max_evaluations);
    let mut callback = FitCallback::new(problem.names().to_vec(), cancel);

    let result = match solver.solve(&problem, &mut callback) {
        Ok(result) if result.status == SolveStatus::Cancelled => return Err(cancelled(progress)),
        Ok(result) => result,
        Err(Error::Cancelled) => return Err(cancelled(progress)),
        Err(e) => return Err(fail(progress, e)),
    };
    info!("{} finished: {}", solver.name(), result.message);

    problem
        .apply_values(&result.params)
        .map_err(|e| fail(progress, e))?;
    let invocation_count = problem.invocation_count();
    let netlist = problem.into_netlist();

    match fs::read_to_string(&working_path) {
        Ok(text) => progress.emit(ProgressEvent::NetlistSnapshot {
            path: working_path.clone(),
            text,
        }),
        Err(e) => warn!("could not read back {}: {}", working_path.display(), e),
    }

    let summary = OptimizationSummary {
        invocation_count,
        iteration_count: result.iterations,
        initial_cost: result.initial_cost,
        final_cost: result.cost,
        optimality: result.optimality,
        status: result.status,
        message: result.message,
        values: netlist.values(),
    };
    info!(
        "cost {:.6e} -> {:.6e} after {} iteration(s), {} simulator run(s)",
        summary.initial_cost, summary.final_cost, summary.iteration_count, summary.invocation_count
    );

    progress.emit(ProgressEvent::ResultSummary(summary.clone()));
    progress.emit(ProgressEvent::State(SolveState::Converged));
    progress.emit(ProgressEvent::Done);
    Ok(summary)
}

fn fail(progress: &Progress, err: Error) -> Error {
    error!("optimization failed: {}", err);
    progress.emit(ProgressEvent::Failed(err.to_string()));
    progress.emit(ProgressEvent::State(SolveState::Failed));
    err
}

fn cancelled(progress: &Progress) -> Error {
    info!("optimization cancelled");
    progress.emit(ProgressEvent::Cancelled);
    progress.emit(ProgressEvent::State(SolveState::Cancelled));
    Error::Cancelled
}

/// Full workflow from a parsed netlist: variable selection, constraint
/// resolution, working copy, transient directive, then the fit.
pub struct Optimizer {
    netlist: Netlist,
    variables: Option<Vec<String>>,
    constraints: ConstraintSet,
    target: TargetCurve,
    target_column: String,
    working_path: PathBuf,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(
        netlist: Netlist,
        target: TargetCurve,
        target_column: impl Into<String>,
        working_path: impl Into<PathBuf>,
    ) -> Self {
        let target_column = target_column.into();
        Self {
            netlist,
            variables: None,
            constraints: ConstraintSet::default(),
            target_column: normalize_probe(&target_column).unwrap_or(target_column),
            target,
            working_path: working_path.into(),
            config: OptimizerConfig::default(),
        }
    }

    /// Replace the `;OPTIMIZE` markers with an explicit selection.
    pub fn with_variables<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.variables = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_constraints(mut self, constraints: ConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Resolve constraints and write the working netlist.
    fn prepare(self) -> Result<OptimizationRequest> {
        let Self {
            mut netlist,
            variables,
            constraints,
            target,
            target_column,
            working_path,
            config,
        } = self;

        if let Some(names) = &variables {
            netlist.select_variables(names.as_slice())?;
        }
        let variable_names = netlist.variable_names();
        if variable_names.is_empty() {
            return Err(Error::NoVariables);
        }

        // The set may have been built before the selection changed
        let node_expressions = netlist.node_expressions();
        let mut classified = Vec::with_capacity(constraints.len());
        for entry in constraints.constraints() {
            let kind = classify(&entry.constraint, &variable_names, &node_expressions)?;
            classified.push(ClassifiedConstraint {
                constraint: entry.constraint.clone(),
                kind,
            });
        }
        if detect_cycle(constraints.iter())? {
            return Err(Error::constraint(
                "equality set",
                "constraints form a cyclic dependency",
            ));
        }

        let resolution = apply_parameter_constraints(&classified, &mut netlist, config.bound_repair)?;
        let node_bounds = build_node_bounds(&classified)?;

        if netlist.path() != working_path.as_path() {
            netlist.copy_to(&working_path)?;
        }
        netlist.patch(&working_path, &resolution.updates)?;

        // Every constrained node is printed, `=` ones included
        let probes = constraints.constrained_nodes();
        let transient = TransientSpec::from_curve(&target, config.transient_divisions);
        inject_transient_directive(&working_path, &transient, &target_column, &probes)?;
        info!(
            "working netlist {} ready: {} variable(s), {} equality constraint(s), {} node bound(s)",
            working_path.display(),
            netlist.variable_names().len(),
            resolution.equalities.len(),
            node_bounds.len()
        );

        Ok(OptimizationRequest {
            netlist,
            working_path,
            target,
            target_column,
            node_bounds,
            equalities: resolution.equalities,
            config,
        })
    }

    /// Solve on the calling thread with the configured Xyce runner.
    pub fn run(self, progress: &Progress, cancel: Arc<AtomicBool>) -> Result<OptimizationSummary> {
        let runner = XyceRunner::new(self.config.simulator.clone()).with_cancel_flag(cancel.clone());
        self.run_with(&runner, progress, cancel)
    }

    /// Solve on the calling thread with any simulator.
    pub fn run_with(
        self,
        simulator: &dyn Simulator,
        progress: &Progress,
        cancel: Arc<AtomicBool>,
    ) -> Result<OptimizationSummary> {
        progress.emit(ProgressEvent::State(SolveState::Validating));
        let request = self.prepare().map_err(|e| fail(progress, e))?;
        solve(request, simulator, progress, cancel)
    }

    /// Solve on a background thread with the configured Xyce runner.
    pub fn spawn(self) -> OptimizationHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let runner = XyceRunner::new(self.config.simulator.clone()).with_cancel_flag(cancel.clone());
        self.spawn_inner(runner, cancel)
    }

    /// Solve on a background thread with any simulator.
    pub fn spawn_with<S: Simulator + Send + 'static>(self, simulator: S) -> OptimizationHandle {
        self.spawn_inner(simulator, Arc::new(AtomicBool::new(false)))
    }

    fn spawn_inner<S: Simulator + Send + 'static>(
        self,
        simulator: S,
        cancel: Arc<AtomicBool>,
    ) -> OptimizationHandle {
        let (progress, events) = Progress::channel();
        let flag = cancel.clone();
        let worker = thread::spawn(move || self.run_with(&simulator, &progress, flag));
        OptimizationHandle {
            events,
            cancel,
            worker,
        }
    }
}

/// Caller side of a background solve.
pub struct OptimizationHandle {
    events: Receiver<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<Result<OptimizationSummary>>,
}

impl OptimizationHandle {
    /// Progress events in emission order. The channel closes when the
    /// worker exits.
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Ask the worker to stop. A running simulator process is killed.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and return its outcome.
    pub fn join(self) -> Result<OptimizationSummary> {
        self.worker.join().map_err(|panic| {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Error::Worker(reason)
        })?
    }
}
