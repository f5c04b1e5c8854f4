use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use approx::assert_relative_eq;
use circuitfit::{
    Constraint, ConstraintSet, Error, Netlist, OptimizationSummary, Optimizer, OptimizerConfig,
    Progress, ProgressEvent, Result, SimulationResult, Simulator, SolveState, TargetCurve,
};

const DIVIDER: &str = "\
resistor divider
V1 in 0 10
R1 in mid 1k ;OPTIMIZE
R2 mid 0 1k
.end
";

/// Solves the divider analytically from whatever the working file holds.
struct DividerModel {
    runs: AtomicUsize,
}

impl DividerModel {
    fn new() -> Self {
        Self {
            runs: AtomicUsize::new(0),
        }
    }
}

impl Simulator for DividerModel {
    fn run(&self, netlist: &Path) -> Result<SimulationResult> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let parsed = Netlist::parse(netlist)?;
        let r1 = parsed.component("R1").map(|c| c.value).unwrap_or(1e3);
        let r2 = parsed.component("R2").map(|c| c.value).unwrap_or(1e3);
        let v = 10.0 * r2 / (r1 + r2);
        Ok(SimulationResult {
            columns: vec!["Index".into(), "TIME".into(), "V(MID)".into()],
            rows: (0..=10)
                .map(|i| vec![i as f64, i as f64 * 0.1, v])
                .collect(),
        })
    }
}

fn workspace() -> (tempfile::TempDir, Netlist, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("divider.cir");
    fs::write(&source, DIVIDER).unwrap();
    let working = dir.path().join("divider_opt.cir");
    (dir, Netlist::parse(&source).unwrap(), working)
}

fn flat_target(level: f64) -> TargetCurve {
    TargetCurve::horizontal_line(level, 0.0, 1.0).unwrap()
}

fn solve(optimizer: Optimizer, simulator: &dyn Simulator) -> (Result<OptimizationSummary>, Vec<ProgressEvent>) {
    let (progress, rx) = Progress::channel();
    let result = optimizer.run_with(simulator, &progress, Arc::new(AtomicBool::new(false)));
    drop(progress);
    (result, rx.iter().collect())
}

#[test]
fn test_divider_converges_to_ratio() {
    let (_dir, netlist, working) = workspace();
    let model = DividerModel::new();
    let optimizer = Optimizer::new(netlist, flat_target(4.0), "V(mid)", &working)
        .with_config(OptimizerConfig::default().with_max_iterations(50));

    let (result, events) = solve(optimizer, &model);
    let summary = result.unwrap();

    assert_relative_eq!(summary.values["R1"], 1500.0, max_relative = 1e-4);
    assert!(summary.final_cost < summary.initial_cost);
    assert_eq!(summary.invocation_count, model.runs.load(Ordering::Relaxed));
    assert_eq!(events.last(), Some(&ProgressEvent::Done));

    // The working file holds the solution and the injected analysis
    let text = fs::read_to_string(&working).unwrap();
    assert!(text.contains(".PRINT TRAN V(mid)"));
    let reparsed = Netlist::parse(&working).unwrap();
    assert_relative_eq!(reparsed.component("R1").unwrap().value, 1500.0, max_relative = 1e-4);
    assert_eq!(reparsed.component("R2").unwrap().value, 1000.0);
}

#[test]
fn test_equality_constraint_follows_variable() {
    let (_dir, netlist, working) = workspace();
    let mut constraints = ConstraintSet::for_netlist(&netlist);
    // R2 is fixed, so this is not a parameter constraint on a variable
    assert!(constraints.add(Constraint::equals("R2", "R1 / 2")).is_err());

    let mut netlist = netlist;
    netlist.select_variables(&["R1", "R2"]).unwrap();
    let mut constraints = ConstraintSet::for_netlist(&netlist);
    constraints.add(Constraint::equals("R2", "R1 * 2 / 3")).unwrap();
    let optimizer = Optimizer::new(netlist, flat_target(4.0), "V(mid)", &working);
    let optimizer = optimizer
        .with_constraints(constraints)
        .with_config(OptimizerConfig::default().with_max_iterations(20));

    let model = DividerModel::new();
    let (result, _) = solve(optimizer, &model);
    let summary = result.unwrap();
    // Ratio is pinned, so V(mid) = 4 for every R1
    assert_relative_eq!(summary.values["R2"], summary.values["R1"] * 2.0 / 3.0, max_relative = 1e-9);
    assert!(summary.final_cost < 1e-12);
}

#[test]
fn test_violated_node_bound_is_penalised() {
    let (_dir, netlist, working) = workspace();
    let mut constraints = ConstraintSet::for_netlist(&netlist);
    constraints.add(Constraint::at_most("V(mid)", "4.5")).unwrap();

    let optimizer = Optimizer::new(netlist, flat_target(4.0), "V(mid)", &working)
        .with_constraints(constraints)
        .with_config(OptimizerConfig::default().with_penalty(1e3));

    let (result, _) = solve(optimizer, &DividerModel::new());
    let summary = result.unwrap();

    // Every point near the start violates the bound, so the
    // penalty surface is flat and the solve stops where it began.
    assert_relative_eq!(summary.initial_cost, 0.5 * 11.0 * 1e6);
    assert_eq!(summary.values["R1"], 1000.0);
}

#[test]
fn test_cancellation_from_handle() {
    let (_dir, netlist, working) = workspace();

    /// Blocks every run until the solve is cancelled.
    struct Stalling(Arc<AtomicBool>);

    impl Simulator for Stalling {
        fn run(&self, _netlist: &Path) -> Result<SimulationResult> {
            while !self.0.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(circuitfit::SimulatorError::Cancelled.into())
        }
    }

    let released = Arc::new(AtomicBool::new(false));
    let handle = Optimizer::new(netlist, flat_target(4.0), "V(mid)", &working)
        .spawn_with(Stalling(released.clone()));

    loop {
        match handle.events().recv() {
            Ok(ProgressEvent::State(SolveState::Running)) => break,
            Ok(_) => continue,
            Err(_) => panic!("worker exited before running"),
        }
    }
    handle.cancel();
    released.store(true, Ordering::Relaxed);

    let rest: Vec<ProgressEvent> = handle.events().iter().collect();
    assert!(rest.contains(&ProgressEvent::Cancelled));
    assert_eq!(rest.last(), Some(&ProgressEvent::State(SolveState::Cancelled)));
    assert!(matches!(handle.join(), Err(Error::Cancelled)));
}

#[cfg(unix)]
#[test]
fn test_script_simulator_end_to_end() {
    use circuitfit::{SimulatorConfig, XyceRunner};

    let (dir, netlist, working) = workspace();
    let script = dir.path().join("fake_xyce.sh");
    fs::write(
        &script,
        "printf 'Index,TIME,V(MID)\\n0,0,5\\n1,0.5,5\\n2,1,5\\nEnd of Xyce(TM) Simulation\\n' > \"$1.prn\"\n",
    )
    .unwrap();

    let runner = XyceRunner::new(SimulatorConfig {
        executable: "sh".into(),
        args: vec![script.display().to_string()],
        timeout_secs: 10,
    });
    let optimizer = Optimizer::new(netlist, flat_target(4.0), "V(mid)", &working)
        .with_config(OptimizerConfig::default().with_max_iterations(5));

    let (result, events) = solve(optimizer, &runner);
    let summary = result.unwrap();

    // Output ignores the netlist, so the residual is a constant 1 V offset
    assert_relative_eq!(summary.final_cost, 0.5 * 3.0);
    assert!(summary.invocation_count > 0);
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::CurveSample { .. })));
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::NetlistSnapshot { .. })));
}

#[test]
fn test_bounded_fit_against_constant_output() {
    /// Always reports V(2) = 5 V, whatever the component values.
    struct FiveVolts;

    impl Simulator for FiveVolts {
        fn run(&self, _netlist: &Path) -> Result<SimulationResult> {
            Ok(SimulationResult {
                columns: vec!["TIME".into(), "V(2)".into()],
                rows: (0..=10).map(|i| vec![i as f64 * 0.1, 5.0]).collect(),
            })
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rc.cir");
    fs::write(&source, "rc\nV1 1 0 10\nR1 1 2 1k ;OPTIMIZE\nC1 2 0 1u\n.end\n").unwrap();
    let mut netlist = Netlist::parse(&source).unwrap();
    netlist.set_bounds("R1", 1.0, 10_000.0).unwrap();

    let optimizer = Optimizer::new(netlist, flat_target(4.0), "V(2)", dir.path().join("rc_opt.cir"));
    let (result, events) = solve(optimizer, &FiveVolts);
    let summary = result.unwrap();

    // Output does not depend on R1: zero Jacobian, so the solve stops at
    // the start with the 1 V offset left in the cost.
    assert_relative_eq!(summary.final_cost, 0.5 * 11.0);
    assert!(summary.invocation_count > 0);
    assert_eq!(summary.iteration_count, 0);
    let r1 = summary.values["R1"];
    assert!((1.0..=10_000.0).contains(&r1));
    assert_eq!(r1, 1000.0);
    assert_eq!(events.last(), Some(&ProgressEvent::Done));
}
