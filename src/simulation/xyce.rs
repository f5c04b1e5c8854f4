use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulatorError};

/// Runs a netlist file and returns its tabular transient output.
pub trait Simulator {
    fn run(&self, netlist: &Path) -> Result<SimulationResult>;
}

/// How the simulator executable is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Path to the executable (default: "Xyce" in PATH).
    pub executable: String,
    /// Arguments placed before the netlist path.
    pub args: Vec<String>,
    /// Per-run time budget in seconds.
    pub timeout_secs: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            executable: "Xyce".to_string(),
            args: vec!["-delim".into(), "COMMA".into(), "-quiet".into()],
            timeout_secs: 30,
        }
    }
}

/// Column names plus numeric rows read from a `.prn` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl SimulationResult {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx).copied()).collect())
    }

    /// `TIME` when present, else column 1 after a leading `INDEX`, else column 0.
    pub fn independent_index(&self) -> usize {
        if let Some(idx) = self.column_index("TIME") {
            return idx;
        }
        match self.columns.first() {
            Some(first) if first.eq_ignore_ascii_case("INDEX") && self.columns.len() > 1 => 1,
            _ => 0,
        }
    }

    pub fn independent_column(&self) -> Vec<f64> {
        let idx = self.independent_index();
        self.rows.iter().filter_map(|r| r.get(idx).copied()).collect()
    }

    /// Aligned (x, y) samples for the named column.
    pub fn series(&self, name: &str) -> Option<(Vec<f64>, Vec<f64>)> {
        let y_idx = self.column_index(name)?;
        let x_idx = self.independent_index();
        Some(
            self.rows
                .iter()
                .filter_map(|r| Some((*r.get(x_idx)?, *r.get(y_idx)?)))
                .unzip(),
        )
    }
}

/// `<netlist>.prn`, the table the simulator writes next to its input.
pub fn output_path(netlist: &Path) -> PathBuf {
    let mut name: OsString = netlist.as_os_str().to_owned();
    name.push(".prn");
    PathBuf::from(name)
}

/// Read a delimited output table.
///
/// Cells that do not parse as numbers are dropped, as are rows left with
/// no numeric cells (the trailing end-of-simulation marker).
pub fn parse_output(path: &Path) -> Result<SimulationResult> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SimulatorError::MissingOutput(path.to_path_buf()).into());
        }
        Err(e) => return Err(SimulatorError::Io(e).into()),
    };

    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Err(SimulatorError::EmptyOutput(path.to_path_buf()).into());
    };

    let comma = header.contains(',');
    let split = |line: &str| -> Vec<String> {
        if comma {
            line.split(',').map(|c| c.trim().to_string()).collect()
        } else {
            line.split_whitespace().map(str::to_string).collect()
        }
    };

    let columns = split(header);
    let rows: Vec<Vec<f64>> = lines
        .map(|line| {
            split(line)
                .iter()
                .filter_map(|cell| cell.parse::<f64>().ok())
                .collect::<Vec<f64>>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    if rows.is_empty() {
        return Err(SimulatorError::EmptyOutput(path.to_path_buf()).into());
    }

    Ok(SimulationResult { columns, rows })
}

/// Subprocess runner for a Xyce-compatible executable.
#[derive(Debug, Clone, Default)]
pub struct XyceRunner {
    config: SimulatorConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl XyceRunner {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Kill the in-flight run as soon as `flag` becomes true.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Wait for the child, killing it on timeout or cancellation.
    fn wait(&self, child: &mut Child) -> std::result::Result<ExitStatus, SimulatorError> {
        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let poll_interval = Duration::from_millis(20);

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if self.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SimulatorError::Cancelled);
            }
            if start.elapsed() > timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SimulatorError::Timeout(self.config.timeout_secs));
            }
            thread::sleep(poll_interval);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

impl Simulator for XyceRunner {
    fn run(&self, netlist: &Path) -> Result<SimulationResult> {
        let prn = output_path(netlist);
        match fs::remove_file(&prn) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(SimulatorError::Io(e).into()),
        }

        let mut child = Command::new(&self.config.executable)
            .args(&self.config.args)
            .arg(netlist)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SimulatorError::NotFound {
                executable: self.config.executable.clone(),
                reason: e.to_string(),
            })?;

        // Drain both pipes so a chatty simulator cannot block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // Readers are detached on kill; grandchildren may still hold the pipes
        let status = self.wait(&mut child)?;
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(SimulatorError::Failed {
                status,
                stdout,
                stderr,
            }
            .into());
        }

        debug!("{} finished for {}", self.config.executable, netlist.display());
        parse_output(&prn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn write(dir: &tempfile::TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = SimulatorConfig::default();
        assert_eq!(config.executable, "Xyce");
        assert_eq!(config.args, vec!["-delim", "COMMA", "-quiet"]);
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("/tmp/work/amp.cir")),
            PathBuf::from("/tmp/work/amp.cir.prn")
        );
    }

    #[test]
    fn test_parse_comma_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "a.prn",
            "Index,TIME,V(2),V(1)\n0,0.0,4.5,10\n1,1e-3,4.75,10\n2,2e-3,5.0,10\nEnd of Xyce(TM) Simulation\n",
        );
        let result = parse_output(&path).unwrap();
        assert_eq!(result.columns, vec!["Index", "TIME", "V(2)", "V(1)"]);
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.independent_index(), 1);
        assert_eq!(result.column("v(2)").unwrap(), vec![4.5, 4.75, 5.0]);
        let (x, y) = result.series("V(2)").unwrap();
        assert_eq!(x, vec![0.0, 1e-3, 2e-3]);
        assert_eq!(y, vec![4.5, 4.75, 5.0]);
        assert!(result.column("V(9)").is_none());
    }

    #[test]
    fn test_parse_whitespace_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "b.prn", "Index   V(2)\n0   1.0\n1   2.0\nEnd of run\n");
        let result = parse_output(&path).unwrap();
        assert_eq!(result.rows, vec![vec![0.0, 1.0], vec![1.0, 2.0]]);
        assert_eq!(result.independent_index(), 1);

        let path = write(&dir, "c.prn", "t V(out)\n0 1\n1 2\n");
        assert_eq!(parse_output(&path).unwrap().independent_index(), 0);
    }

    #[test]
    fn test_parse_output_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.prn");
        assert!(matches!(
            parse_output(&missing),
            Err(Error::Simulator(SimulatorError::MissingOutput(_)))
        ));

        let empty = write(&dir, "e.prn", "Index,TIME,V(2)\nEnd of Xyce(TM) Simulation\n");
        assert!(matches!(
            parse_output(&empty),
            Err(Error::Simulator(SimulatorError::EmptyOutput(_)))
        ));
        let blank = write(&dir, "f.prn", "");
        assert!(matches!(
            parse_output(&blank),
            Err(Error::Simulator(SimulatorError::EmptyOutput(_)))
        ));
    }

    #[test]
    fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let netlist = write(&dir, "n.cir", "title\n");
        let runner = XyceRunner::new(SimulatorConfig {
            executable: "circuitfit-no-such-simulator".into(),
            ..SimulatorConfig::default()
        });
        assert!(matches!(
            runner.run(&netlist),
            Err(Error::Simulator(SimulatorError::NotFound { .. }))
        ));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn runner(script: &Path, timeout_secs: u64) -> XyceRunner {
            XyceRunner::new(SimulatorConfig {
                executable: "sh".into(),
                args: vec![script.display().to_string()],
                timeout_secs,
            })
        }

        #[test]
        fn test_runs_script_and_reads_prn() {
            let dir = tempfile::tempdir().unwrap();
            let netlist = write(&dir, "n.cir", "title\n");
            let script = write(
                &dir,
                "sim.sh",
                "echo running\nprintf 'Index,TIME,V(2)\\n0,0,5\\n1,1,5\\nEnd of Xyce(TM) Simulation\\n' > \"$1.prn\"\n",
            );
            let result = runner(&script, 10).run(&netlist).unwrap();
            assert_eq!(result.column("V(2)").unwrap(), vec![5.0, 5.0]);
        }

        #[test]
        fn test_non_zero_exit() {
            let dir = tempfile::tempdir().unwrap();
            let netlist = write(&dir, "n.cir", "title\n");
            let script = write(&dir, "fail.sh", "echo boom >&2\nexit 3\n");
            match runner(&script, 10).run(&netlist) {
                Err(Error::Simulator(SimulatorError::Failed { status, stderr, .. })) => {
                    assert_eq!(status.code(), Some(3));
                    assert!(stderr.contains("boom"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn test_no_output_written() {
            let dir = tempfile::tempdir().unwrap();
            let netlist = write(&dir, "n.cir", "title\n");
            let script = write(&dir, "quiet.sh", "exit 0\n");
            assert!(matches!(
                runner(&script, 10).run(&netlist),
                Err(Error::Simulator(SimulatorError::MissingOutput(_)))
            ));
        }

        #[test]
        fn test_timeout_kills_child() {
            let dir = tempfile::tempdir().unwrap();
            let netlist = write(&dir, "n.cir", "title\n");
            let script = write(&dir, "slow.sh", "exec sleep 10\n");
            let start = Instant::now();
            assert!(matches!(
                runner(&script, 1).run(&netlist),
                Err(Error::Simulator(SimulatorError::Timeout(1)))
            ));
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn test_cancel_flag_kills_child() {
            let dir = tempfile::tempdir().unwrap();
            let netlist = write(&dir, "n.cir", "title\n");
            let script = write(&dir, "slow.sh", "exec sleep 10\n");
            let flag = Arc::new(AtomicBool::new(true));
            let runner = runner(&script, 30).with_cancel_flag(flag);
            assert!(matches!(
                runner.run(&netlist),
                Err(Error::Simulator(SimulatorError::Cancelled))
            ));
        }
    }
}
