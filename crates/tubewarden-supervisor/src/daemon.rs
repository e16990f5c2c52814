//! The supervisor daemon loop.
//!
//! Startup (in order): single-instance check, kill-all of every configured
//! script, `SIGCHLD` ignored. Then, every polling interval:
//!
//! 1. re-read the script list (the previous list is kept if reading fails)
//! 2. kill the processes of scripts removed from the configuration
//! 3. log a [`StatusReport`]
//! 4. reconcile the [`ScriptTracker`]
//! 5. start missing scripts and prune duplicates down to the newest pid
//! 6. sleep, then force a kill-all once the restart interval has elapsed
//!
//! Only [`WardenError::AlreadyRunning`] escapes; every other failure is logged
//! and the loop carries on.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use tubewarden_config::{DaemonConfig, ScriptSource};
use tubewarden_core::{Pid, Result, ScriptId, WardenError, WorkerScript};

use crate::launcher::Launcher;
use crate::registry::{self, ProcessRegistry};
use crate::report::{ScriptLine, StatusReport};
use crate::tracker::{AlertHook, ScriptTracker};

/// Set the process-wide timezone (`TZ`).
///
/// Must run before any other thread exists, i.e. before the async runtime is built.
pub fn apply_timezone(timezone: &str) {
    if timezone.is_empty() {
        return;
    }
    // SAFETY: called from `main` while the process is still single-threaded.
    unsafe { std::env::set_var("TZ", timezone) };
}

/// Process-wide supervisor state. Never persisted.
#[derive(Debug, Clone)]
pub struct SupervisorState {
    /// Wall-clock start time
    pub started_at: DateTime<Local>,
    /// Monotonic start time
    pub started: Instant,
    /// Last forced restart of every worker
    pub last_kill_all: Instant,
    /// Script list in effect for the current cycle
    pub current_scripts: Vec<WorkerScript>,
    /// Pids observed or started for each script on the last cycle
    pub observed: BTreeMap<ScriptId, Vec<Pid>>,
}

impl SupervisorState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: Local::now(),
            started: now,
            last_kill_all: now,
            current_scripts: Vec::new(),
            observed: BTreeMap::new(),
        }
    }
}

/// Keeps every configured worker script running as exactly one process.
pub struct Supervisor<R: ProcessRegistry, L: Launcher> {
    registry: R,
    launcher: L,
    source: Box<dyn ScriptSource>,
    tracker: ScriptTracker,
    options: DaemonConfig,
    state: SupervisorState,
}

impl<R: ProcessRegistry, L: Launcher> Supervisor<R, L> {
    /// Create a supervisor. Nothing happens until [`start`](Self::start) or [`run`](Self::run).
    pub fn new(
        registry: R,
        launcher: L,
        source: Box<dyn ScriptSource>,
        options: DaemonConfig,
        alert: Box<dyn AlertHook>,
    ) -> Self {
        let tracker = ScriptTracker::new(options.alert_interval_cycles, alert);
        Self {
            registry,
            launcher,
            source,
            tracker,
            options,
            state: SupervisorState::new(),
        }
    }

    /// Run the startup sequence.
    ///
    /// Returns [`WardenError::AlreadyRunning`] with the lowest pid of another
    /// supervisor instance, in which case nothing was killed.
    pub fn start(&mut self) -> Result<()> {
        let own_pid = std::process::id();
        if let Some(pid) = self.registry.self_pids(own_pid).into_iter().min() {
            return Err(WardenError::AlreadyRunning { pid });
        }

        info!(pid = own_pid, "supervisor starting");
        self.state.current_scripts = self.source.load_scripts().unwrap_or_else(|e| {
            warn!(error = %e, "cannot load scripts at startup, nothing to clean up");
            Vec::new()
        });

        let killed = self.kill_all();
        info!(killed, scripts = self.state.current_scripts.len(), "startup kill-all done");
        self.state.last_kill_all = Instant::now();

        if let Err(e) = self.launcher.ignore_child_exit() {
            warn!(error = %e, "cannot ignore child exit, zombies may accumulate");
        }
        Ok(())
    }

    /// Run [`start`](Self::start), then poll forever.
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;
        loop {
            self.run_cycle();
            tokio::time::sleep(self.options.polling_interval()).await;
            self.check_restart();
        }
    }

    /// One poll iteration, without the sleep.
    pub fn run_cycle(&mut self) {
        let scripts = match self.source.load_scripts() {
            Ok(scripts) => scripts,
            Err(e) => {
                warn!(error = %e, "cannot reload scripts, keeping previous list");
                self.state.current_scripts.clone()
            }
        };

        let configured: HashSet<&ScriptId> = scripts.iter().map(|s| &s.id).collect();
        let removed: Vec<WorkerScript> = self
            .state
            .current_scripts
            .iter()
            .filter(|s| !configured.contains(&s.id))
            .cloned()
            .collect();
        for script in &removed {
            let killed = self.kill_script(script);
            info!(script = %script, killed, "script removed from configuration");
            self.state.observed.remove(&script.id);
        }

        self.state.current_scripts = scripts;

        info!("{}", self.status_report());

        self.tracker.reconcile(&self.state.current_scripts, &self.registry);

        for script in self.state.current_scripts.clone() {
            self.ensure_running(&script);
        }
    }

    /// Start `script` if no process runs it; otherwise kill all but the newest pid.
    ///
    /// Returns the pid left running, if any.
    pub fn ensure_running(&mut self, script: &WorkerScript) -> Option<Pid> {
        let mut pids = self.registry.find_processes(script);
        pids.sort_unstable();

        let Some(&keep) = pids.last() else {
            return match self.launcher.launch(script) {
                Ok(pid) => {
                    info!(script = %script, pid, "started script");
                    self.state.observed.insert(script.id.clone(), vec![pid]);
                    Some(pid)
                }
                Err(e) => {
                    warn!(script = %script, error = %e, "cannot start script");
                    self.state.observed.remove(&script.id);
                    None
                }
            };
        };

        for &pid in &pids[..pids.len() - 1] {
            match self.registry.terminate(pid) {
                Ok(()) => info!(script = %script, pid, keep, "killed duplicate process"),
                Err(e) => warn!(script = %script, pid, error = %e, "cannot kill duplicate process"),
            }
        }
        self.state.observed.insert(script.id.clone(), vec![keep]);
        Some(keep)
    }

    /// Kill every process of every current script. Returns the number of kill signals sent.
    pub fn kill_all(&mut self) -> usize {
        let scripts = self.state.current_scripts.clone();
        let killed: usize = scripts.iter().map(|script| self.kill_script(script)).sum();
        self.state.observed.clear();
        killed
    }

    /// Force a kill-all once more than the restart interval has passed since the last one.
    ///
    /// Returns true if the restart happened.
    pub fn check_restart(&mut self) -> bool {
        let elapsed = self.state.last_kill_all.elapsed();
        if !restart_due(elapsed, self.options.restart_interval()) {
            return false;
        }

        let killed = self.kill_all();
        info!(killed, elapsed_secs = elapsed.as_secs(), "periodic restart of all scripts");
        self.state.last_kill_all = Instant::now();
        true
    }

    /// Status of the current script list.
    pub fn status_report(&self) -> StatusReport {
        self.report_for(&self.state.current_scripts)
    }

    /// Status of an arbitrary script list. Queries the registry; changes nothing.
    pub fn report_for(&self, scripts: &[WorkerScript]) -> StatusReport {
        let lines = scripts
            .iter()
            .map(|script| ScriptLine {
                script: script.clone(),
                pid: self.registry.find_processes(script).into_iter().min(),
                status: self.tracker.status(&script.id),
            })
            .collect();

        StatusReport {
            pid: std::process::id(),
            memory_mb: registry::resident_memory_mb(),
            started_at: self.state.started_at,
            uptime: self.state.started.elapsed(),
            scripts: lines,
        }
    }

    /// The script tracker (read-only).
    pub fn tracker(&self) -> &ScriptTracker {
        &self.tracker
    }

    /// Current supervisor state.
    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    fn kill_script(&self, script: &WorkerScript) -> usize {
        let mut killed = 0;
        for pid in self.registry.find_processes(script) {
            match self.registry.terminate(pid) {
                Ok(()) => killed += 1,
                Err(e) => warn!(script = %script, pid, error = %e, "cannot kill process"),
            }
        }
        debug!(script = %script, killed, "killed script processes");
        killed
    }
}

fn restart_due(elapsed: Duration, interval: Duration) -> bool {
    elapsed > interval
}

impl<R: ProcessRegistry, L: Launcher> std::fmt::Debug for Supervisor<R, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tracker", &self.tracker)
            .field("options", &self.options)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
