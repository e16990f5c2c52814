//! Human-readable supervisor status.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tubewarden_core::{Pid, ScriptStatus, WorkerScript};

/// One script line in a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptLine {
    /// Configured script
    pub script: WorkerScript,
    /// Lowest matching pid, or `None` while the script is starting up
    pub pid: Option<Pid>,
    /// Tracker status, `None` if the tracker has not seen the script yet
    pub status: Option<ScriptStatus>,
}

/// Snapshot of the supervisor for display. Building one has no control effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Supervisor pid
    pub pid: Pid,
    /// Resident memory in MiB, when readable
    pub memory_mb: Option<f64>,
    /// Supervisor start time
    pub started_at: DateTime<Local>,
    /// Time since start
    pub uptime: Duration,
    /// One line per configured script
    pub scripts: Vec<ScriptLine>,
}

impl StatusReport {
    /// Number of scripts with a live process.
    pub fn running(&self) -> usize {
        self.scripts.iter().filter(|line| line.pid.is_some()).count()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Whole seconds keep the uptime readable ("1h 2m 3s").
        let uptime = Duration::from_secs(self.uptime.as_secs());
        let memory = self
            .memory_mb
            .map_or_else(|| "n/a".to_string(), |mb| format!("{mb:.2} MB"));

        writeln!(f, "tubewarden daemon is watching [pid: {}]", self.pid)?;
        writeln!(
            f,
            "  started: {}  uptime: {}  memory: {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            humantime::format_duration(uptime),
            memory
        )?;
        writeln!(f, "  scripts: {} configured, {} running", self.scripts.len(), self.running())?;

        for line in &self.scripts {
            let state = match line.pid {
                Some(pid) => format!("[pid: {pid}]"),
                None => "[awaking...]".to_string(),
            };
            let status = line.status.map_or_else(|| "-".to_string(), |s| s.to_string());
            writeln!(f, "  {state:<14} {status:<8} {}", line.script)?;
        }
        Ok(())
    }
}
