use std::cell::{Cell, OnceCell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use super::curve::{TargetCurve, resample};
use super::solvers::Problem;
use crate::core::{EqualityConstraint, NodeBounds, ValueUpdate, propagate_equalities};
use crate::error::{Error, Result, SimulatorError};
use crate::optimizer::progress::{Progress, ProgressEvent};
use crate::simulation::{Netlist, SimulationResult, Simulator};

const DEFAULT_PENALTY: f64 = 1e6;
const DEFAULT_COUNTER_INTERVAL: usize = 5;

/// Curve-fit residuals for the variable components of a working netlist.
///
/// Every residual evaluation patches the working file and runs the
/// simulator once; evaluations are strictly sequential.
pub struct CurveFitProblem<'a> {
    netlist: RefCell<Netlist>,
    working_path: PathBuf,
    simulator: &'a dyn Simulator,

    target: TargetCurve,
    target_column: String,

    names: Vec<String>,
    initial: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    node_bounds: NodeBounds,
    equalities: Vec<EqualityConstraint>,

    penalty: f64,
    counter_interval: usize,
    progress: Progress,
    cancel: Option<Arc<AtomicBool>>,

    // Fixed by the first successful run
    master_grid: OnceCell<Vec<f64>>,
    invocations: Cell<usize>,
}

impl<'a> CurveFitProblem<'a> {
    /// Take the variable components of `netlist` as the parameter vector.
    ///
    /// Initial values are clamped into their bounds.
    pub fn new(
        netlist: Netlist,
        working_path: impl Into<PathBuf>,
        simulator: &'a dyn Simulator,
        target: TargetCurve,
        target_column: impl Into<String>,
    ) -> Result<Self> {
        let mut names = Vec::new();
        let mut initial = Vec::new();
        let mut bounds = Vec::new();
        for component in netlist.variable_components() {
            if component.min_value > component.max_value {
                return Err(Error::constraint(
                    &component.name,
                    format!(
                        "empty range: min {} exceeds max {}",
                        component.min_value, component.max_value
                    ),
                ));
            }
            names.push(component.name.clone());
            initial.push(component.value.clamp(component.min_value, component.max_value));
            bounds.push((component.min_value, component.max_value));
        }
        if names.is_empty() {
            return Err(Error::NoVariables);
        }

        Ok(Self {
            netlist: RefCell::new(netlist),
            working_path: working_path.into(),
            simulator,
            target,
            target_column: target_column.into(),
            names,
            initial,
            bounds,
            node_bounds: NodeBounds::new(),
            equalities: Vec::new(),
            penalty: DEFAULT_PENALTY,
            counter_interval: DEFAULT_COUNTER_INTERVAL,
            progress: Progress::disabled(),
            cancel: None,
            master_grid: OnceCell::new(),
            invocations: Cell::new(0),
        })
    }

    pub fn with_node_bounds(mut self, node_bounds: NodeBounds) -> Self {
        self.node_bounds = node_bounds;
        self
    }

    pub fn with_equalities(mut self, equalities: Vec<EqualityConstraint>) -> Self {
        self.equalities = equalities;
        self
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_counter_interval(mut self, interval: usize) -> Self {
        self.counter_interval = interval.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.get()
    }

    pub fn master_grid(&self) -> Option<&[f64]> {
        self.master_grid.get().map(Vec::as_slice)
    }

    pub fn into_netlist(self) -> Netlist {
        self.netlist.into_inner()
    }

    /// Write `params` and the propagated equalities to the working file.
    pub fn apply_values(&self, params: &[f64]) -> Result<Vec<ValueUpdate>> {
        let mut netlist = self.netlist.borrow_mut();
        let mut updates: Vec<ValueUpdate> = Vec::with_capacity(params.len() + self.equalities.len());
        for (name, &value) in self.names.iter().zip(params) {
            netlist.set_value(name, value)?;
            updates.push(ValueUpdate::new(name.clone(), value));
        }
        updates.extend(propagate_equalities(&self.equalities, &mut netlist)?);
        netlist.patch(&self.working_path, &updates)?;
        Ok(updates)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn penalty_vector(&self, grid: &[f64]) -> Vec<f64> {
        vec![self.penalty; grid.len()]
    }

    /// Samples of `name` against the independent column, rows with a
    /// non-finite abscissa dropped.
    fn column(&self, result: &SimulationResult, name: &str) -> Result<(Vec<f64>, Vec<f64>)> {
        let (x, y) = result.series(name).ok_or_else(|| {
            Error::CurveData(format!(
                "column '{}' not found in simulator output (columns: {})",
                name,
                result.columns.join(", ")
            ))
        })?;
        Ok(x.into_iter().zip(y).filter(|(t, _)| t.is_finite()).unzip())
    }
}

impl Problem for CurveFitProblem<'_> {
    fn residuals(&self, params: &[f64]) -> Result<Vec<f64>> {
        if self.cancelled() {
            return Err(Error::Cancelled);
        }
        let invocation = self.invocations.get() + 1;
        self.invocations.set(invocation);
        debug!("residual #{}: {:?}", invocation, params);
        if invocation % self.counter_interval == 0 {
            self.progress.emit(ProgressEvent::Counter(invocation));
        }

        self.apply_values(params)?;

        let result = match self.simulator.run(&self.working_path) {
            Ok(result) => result,
            Err(Error::Simulator(SimulatorError::Cancelled)) => return Err(Error::Cancelled),
            Err(Error::Simulator(e)) => match self.master_grid.get() {
                Some(grid) => {
                    warn!("simulator run #{} failed, substituting penalty: {}", invocation, e);
                    return Ok(self.penalty_vector(grid));
                }
                None => return Err(Error::Simulator(e)),
            },
            Err(e) => return Err(e),
        };

        let (x, y) = self.column(&result, &self.target_column)?;
        if x.is_empty() {
            return Err(Error::CurveData(format!(
                "no samples for '{}' in simulator output",
                self.target_column
            )));
        }
        let grid = self.master_grid.get_or_init(|| x.clone());

        for (node, bound) in &self.node_bounds {
            let (nx, ny) = self.column(&result, node)?;
            if let Some(v) = resample(&nx, &ny, grid).into_iter().find(|v| !bound.admits(*v)) {
                warn!(
                    "run #{}: {} reached {} outside [{:?}, {:?}], substituting penalty",
                    invocation, node, v, bound.lower, bound.upper
                );
                self.progress.emit(ProgressEvent::CurveSample { invocation, x, y });
                return Ok(self.penalty_vector(grid));
            }
        }

        let ideal = self.target.sample(grid);
        let simulated = resample(&x, &y, grid);
        self.progress.emit(ProgressEvent::CurveSample { invocation, x, y });

        Ok(ideal.iter().zip(&simulated).map(|(i, s)| i - s).collect())
    }

    fn num_params(&self) -> usize {
        self.names.len()
    }

    fn initial_params(&self) -> &[f64] {
        &self.initial
    }

    fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }
}
