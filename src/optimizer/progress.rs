use std::path::PathBuf;

use crossbeam::channel::{Receiver, Sender, unbounded};
use indexmap::IndexMap;

use crate::optimization::SolveStatus;

/// Lifecycle of one solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveState {
    Idle,
    Validating,
    Running,
    Converged,
    Failed,
    Cancelled,
}

/// Statistics reported when a solve finishes.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationSummary {
    pub invocation_count: usize,
    pub iteration_count: u32,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Infinity norm of the projected gradient at the solution
    pub optimality: f64,
    pub status: SolveStatus,
    pub message: String,
    /// Final value of every component, fixed ones included
    pub values: IndexMap<String, f64>,
}

/// Typed message from the worker to the caller, in emission order.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    State(SolveState),
    /// Simulator invocations so far, sent every few invocations
    Counter(usize),
    /// Waveform of the most recent run
    CurveSample {
        invocation: usize,
        x: Vec<f64>,
        y: Vec<f64>,
    },
    /// The patched working netlist after the solve
    NetlistSnapshot { path: PathBuf, text: String },
    ResultSummary(OptimizationSummary),
    Done,
    Failed(String),
    Cancelled,
}

/// Sending half of the progress channel. Disabled sinks drop everything.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    sender: Option<Sender<ProgressEvent>>,
}

impl Progress {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a connected sink and receiver.
    pub fn channel() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }

    /// A caller that stopped listening does not stop the solve.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (progress, rx) = Progress::channel();
        progress.emit(ProgressEvent::State(SolveState::Validating));
        progress.emit(ProgressEvent::Counter(5));
        progress.emit(ProgressEvent::Done);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ProgressEvent::State(SolveState::Validating),
                ProgressEvent::Counter(5),
                ProgressEvent::Done
            ]
        );
    }

    #[test]
    fn test_disabled_and_dropped_receivers_are_silent() {
        Progress::disabled().emit(ProgressEvent::Done);
        let (progress, rx) = Progress::channel();
        drop(rx);
        progress.emit(ProgressEvent::Done);
    }
}
