use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can stop a solve or reject caller input.
#[derive(Debug, Error)]
pub enum Error {
    /// A numeric literal with an unknown suffix or an unparseable prefix.
    #[error("invalid value '{literal}': {reason}")]
    ValueFormat { literal: String, reason: String },

    /// Structural netlist parse or rewrite failure.
    #[error("{}:{line}: {message}", .path.display())]
    Netlist {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The external simulator failed.
    #[error(transparent)]
    Simulator(#[from] SimulatorError),

    /// Malformed left-hand side, unresolvable expression or cyclic equality set.
    #[error("invalid constraint '{constraint}': {reason}")]
    InvalidConstraint { constraint: String, reason: String },

    /// Target curve or simulated data unusable.
    #[error("curve data error: {0}")]
    CurveData(String),

    /// No component is marked variable.
    #[error("no variable components selected for optimization")]
    NoVariables,

    /// The solve was cancelled by the caller.
    #[error("optimization cancelled")]
    Cancelled,

    /// File system error with the path that caused it.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Constraint interchange or configuration JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The background solve thread panicked.
    #[error("optimization worker panicked: {0}")]
    Worker(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn constraint(constraint: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidConstraint {
            constraint: constraint.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures of a single simulator invocation.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// The executable could not be started.
    #[error("simulator executable '{executable}' not found: {reason}")]
    NotFound { executable: String, reason: String },

    /// The run exceeded its time budget and was killed.
    #[error("simulator timed out after {0} seconds")]
    Timeout(u64),

    /// The process exited unsuccessfully.
    #[error("simulator exited with {status}\nstderr: {stderr}\nstdout: {stdout}")]
    Failed {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// The expected output table does not exist.
    #[error("simulator output not found: {}", .0.display())]
    MissingOutput(PathBuf),

    /// The output table has no numeric rows.
    #[error("no data rows found in simulator output {}", .0.display())]
    EmptyOutput(PathBuf),

    /// The run was killed because the solve was cancelled.
    #[error("simulator run cancelled")]
    Cancelled,

    /// Waiting on or reading from the child process failed.
    #[error("simulator I/O error: {0}")]
    Io(#[from] std::io::Error),
}
