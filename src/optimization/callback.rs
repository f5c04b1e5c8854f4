use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use super::solvers::OptimizationCallback;
use crate::core::format_value;
use crate::error::Result;

/// Iteration result for tracking optimization progress
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub params: Vec<f64>,
    pub cost: f64,
}

/// Logs accepted steps and turns the shared cancel flag into a stop request.
pub struct FitCallback {
    param_names: Vec<String>,
    cancel: Arc<AtomicBool>,
    history: Vec<IterationResult>,
}

impl FitCallback {
    pub fn new(param_names: Vec<String>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            param_names,
            cancel,
            history: Vec::new(),
        }
    }

    /// Get iteration history
    pub fn history(&self) -> &[IterationResult] {
        &self.history
    }
}

impl OptimizationCallback for FitCallback {
    fn on_iteration(&mut self, iteration: u32, params: &[f64], cost: f64) -> Result<()> {
        let values: Vec<String> = self
            .param_names
            .iter()
            .zip(params)
            .map(|(name, &v)| format!("{}={}", name, format_value(v)))
            .collect();
        info!("iter {:4}: cost = {:.6e} [{}]", iteration, cost, values.join(", "));

        self.history.push(IterationResult {
            params: params.to_vec(),
            cost,
        });
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
