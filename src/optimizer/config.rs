use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{BoundRepair, Tolerances};
use crate::error::{Error, Result};
use crate::simulation::SimulatorConfig;

/// Solve settings. Missing JSON fields fall back to the defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub tolerances: Tolerances,
    pub max_iterations: u32,
    /// Residual evaluation budget; `None` for no limit
    pub max_evaluations: Option<usize>,
    /// Value of every residual element when a node bound is violated
    pub penalty: f64,
    /// Emit a counter event every this many simulator invocations
    pub counter_interval: usize,
    /// Transient step is the target's x-range split into this many steps
    pub transient_divisions: usize,
    pub bound_repair: BoundRepair,
    pub simulator: SimulatorConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerances: Tolerances::default(),
            max_iterations: 100,
            max_evaluations: None,
            penalty: 1e6,
            counter_interval: 5,
            transient_divisions: 100,
            bound_repair: BoundRepair::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = tolerances;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = Some(max_evaluations);
        self
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_bound_repair(mut self, policy: BoundRepair) -> Self {
        self.bound_repair = policy;
        self
    }

    pub fn with_simulator(mut self, simulator: SimulatorConfig) -> Self {
        self.simulator = simulator;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OptimizerConfig::default();
        assert_eq!(config.tolerances.xtol, 1e-12);
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.penalty, 1e6);
        assert_eq!(config.counter_interval, 5);
        assert_eq!(config.bound_repair, BoundRepair::Heuristic { step: 1.0, span: 10.0 });
        assert_eq!(config.simulator.executable, "Xyce");
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.json");
        std::fs::write(
            &path,
            r#"{
                "max_iterations": 25,
                "tolerances": { "gtol": 1e-8 },
                "bound_repair": { "policy": "clamp" },
                "simulator": { "executable": "/opt/xyce/bin/Xyce", "timeout_secs": 120 }
            }"#,
        )
        .unwrap();

        let config = OptimizerConfig::load(&path).unwrap();
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.tolerances.gtol, 1e-8);
        assert_eq!(config.tolerances.ftol, 1e-12);
        assert_eq!(config.bound_repair, BoundRepair::Clamp);
        assert_eq!(config.simulator.timeout_secs, 120);
        assert_eq!(config.simulator.args, vec!["-delim", "COMMA", "-quiet"]);
        assert_eq!(config.penalty, 1e6);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(OptimizerConfig::load(&path), Err(Error::Json(_))));
        assert!(matches!(
            OptimizerConfig::load(dir.path().join("missing.json")),
            Err(Error::Io { .. })
        ));
    }
}
