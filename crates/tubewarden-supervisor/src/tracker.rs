//! Script status tracking and grouped alerts.
//!
//! [`ScriptTracker`] owns the table of tracked scripts. Each call to
//! [`ScriptTracker::reconcile`] diffs the configured scripts against the table
//! in two phases:
//!
//! 1. **Identity** - scripts whose command line is not tracked yet are seeded
//!    as [`ScriptStatus::New`] and skipped for the rest of the cycle; tracked
//!    scripts missing from the configuration become [`ScriptStatus::Stopped`].
//! 2. **Liveness** - every other configured script is `Running` when the
//!    registry reports a process for it and `Failed` otherwise.
//!
//! A cycle counter runs modulo the alert interval. When it reaches 2 the alert
//! hook receives the whole table and stopped scripts are pruned.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};
use tubewarden_core::{ScriptId, ScriptStatus, WorkerScript};

use crate::registry::ProcessRegistry;

/// Counter value at which the alert fires within each window.
const ALERT_TICK: u32 = 2;

/// One row of the tracked-script table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedScript {
    /// The configured script
    pub script: WorkerScript,
    /// Status derived on the last cycle
    pub status: ScriptStatus,
    /// When the tracker first saw the script
    pub first_seen: DateTime<Local>,
}

/// Receives the tracked-script table once per alert window.
pub trait AlertHook {
    /// Called with a snapshot of the table, before stopped scripts are pruned.
    fn alert(&self, scripts: &[TrackedScript]);
}

/// Alert hook that logs a grouped warning.
///
/// No delivery channel is wired; recipients are included in the log record so
/// an external collector can route it.
#[derive(Debug, Clone, Default)]
pub struct LogAlert {
    recipients: Vec<String>,
}

impl LogAlert {
    /// Create a log alert for the given recipients.
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }
}

impl AlertHook for LogAlert {
    fn alert(&self, scripts: &[TrackedScript]) {
        let attention: Vec<String> = scripts
            .iter()
            .filter(|t| t.status.needs_attention())
            .map(|t| format!("[{}] {}", t.status, t.script))
            .collect();

        if attention.is_empty() {
            debug!(tracked = scripts.len(), "script alert: all scripts healthy");
            return;
        }

        warn!(
            recipients = ?self.recipients,
            tracked = scripts.len(),
            scripts = ?attention,
            "script alert: {} script(s) need attention",
            attention.len()
        );
    }
}

/// Tracks configured scripts across poll cycles.
pub struct ScriptTracker {
    /// `None` until the first reconcile seeds the table
    scripts: Option<BTreeMap<ScriptId, TrackedScript>>,
    interval: u32,
    run_count: u32,
    alert: Box<dyn AlertHook>,
}

impl std::fmt::Debug for ScriptTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptTracker")
            .field("scripts", &self.scripts)
            .field("interval", &self.interval)
            .field("run_count", &self.run_count)
            .finish_non_exhaustive()
    }
}

impl ScriptTracker {
    /// Create a tracker that alerts every `interval` cycles.
    ///
    /// Intervals below 3 would never reach the alert tick and are raised to 3.
    pub fn new(interval: u32, alert: Box<dyn AlertHook>) -> Self {
        Self {
            scripts: None,
            interval: interval.max(ALERT_TICK + 1),
            run_count: 0,
            alert,
        }
    }

    /// Update script statuses from the configured set and the live process table.
    pub fn reconcile<R: ProcessRegistry + ?Sized>(&mut self, configured: &[WorkerScript], registry: &R) {
        self.run_count = (self.run_count + 1) % self.interval;
        debug!(run_count = self.run_count, "reconciling scripts");

        let Some(tracked) = self.scripts.as_mut() else {
            // First cycle: seed only, no liveness verdicts yet.
            let mut seeded = BTreeMap::new();
            for script in configured {
                seed(&mut seeded, script);
            }
            self.scripts = Some(seeded);
            return;
        };

        let known: HashSet<&str> = tracked.values().map(|t| t.script.command.as_str()).collect();
        let (added, remaining): (Vec<&WorkerScript>, Vec<&WorkerScript>) = configured
            .iter()
            .partition(|script| !known.contains(script.command.as_str()));

        for script in added {
            seed(tracked, script);
        }

        for script in remaining {
            let alive = !registry.find_processes(script).is_empty();
            match tracked.get_mut(&script.id) {
                Some(entry) if alive => entry.status = ScriptStatus::Running,
                Some(entry) => entry.status = ScriptStatus::Failed,
                None => seed(tracked, script),
            }
        }

        let configured_ids: HashSet<&ScriptId> = configured.iter().map(|s| &s.id).collect();
        for entry in tracked.values_mut() {
            if !configured_ids.contains(&entry.script.id) {
                entry.status = ScriptStatus::Stopped;
            }
        }

        if self.run_count == ALERT_TICK {
            let snapshot: Vec<TrackedScript> = tracked.values().cloned().collect();
            self.alert.alert(&snapshot);
            tracked.retain(|_, entry| entry.status != ScriptStatus::Stopped);
        }
    }

    /// Snapshot of the tracked-script table, ordered by command line.
    pub fn snapshot(&self) -> Vec<TrackedScript> {
        let mut scripts: Vec<TrackedScript> = self
            .scripts
            .iter()
            .flat_map(|table| table.values().cloned())
            .collect();
        scripts.sort_by(|a, b| a.script.command.cmp(&b.script.command));
        scripts
    }

    /// Current status of one script, if tracked.
    pub fn status(&self, id: &ScriptId) -> Option<ScriptStatus> {
        self.scripts.as_ref()?.get(id).map(|t| t.status)
    }

    /// Number of tracked scripts.
    pub fn len(&self) -> usize {
        self.scripts.as_ref().map_or(0, BTreeMap::len)
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn seed(table: &mut BTreeMap<ScriptId, TrackedScript>, script: &WorkerScript) {
    info!(script = %script, id = %script.id, "new script");
    table.insert(
        script.id.clone(),
        TrackedScript {
            script: script.clone(),
            status: ScriptStatus::New,
            first_seen: Local::now(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tubewarden_core::{Pid, Result};

    #[derive(Default)]
    struct StaticRegistry {
        running: HashMap<String, Vec<Pid>>,
    }

    impl StaticRegistry {
        fn with(mut self, command: &str, pids: &[Pid]) -> Self {
            self.running.insert(command.to_string(), pids.to_vec());
            self
        }
    }

    impl ProcessRegistry for StaticRegistry {
        fn find_processes(&self, script: &WorkerScript) -> Vec<Pid> {
            self.running.get(&script.command).cloned().unwrap_or_default()
        }

        fn terminate(&self, _pid: Pid) -> Result<()> {
            Ok(())
        }

        fn self_pids(&self, _exclude: Pid) -> Vec<Pid> {
            Vec::new()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingAlert {
        calls: Rc<RefCell<Vec<Vec<TrackedScript>>>>,
    }

    impl AlertHook for RecordingAlert {
        fn alert(&self, scripts: &[TrackedScript]) {
            self.calls.borrow_mut().push(scripts.to_vec());
        }
    }

    fn scripts(commands: &[&str]) -> Vec<WorkerScript> {
        commands.iter().map(WorkerScript::new).collect()
    }

    fn status_of(tracker: &ScriptTracker, command: &str) -> Option<ScriptStatus> {
        tracker.status(&WorkerScript::new(command).id)
    }

    #[test]
    fn test_first_cycle_seeds_new() {
        let mut tracker = ScriptTracker::new(120, Box::new(LogAlert::default()));
        let registry = StaticRegistry::default().with("worker-a", &[10]);

        tracker.reconcile(&scripts(&["worker-a", "worker-b"]), &registry);

        assert_eq!(tracker.len(), 2);
        assert_eq!(status_of(&tracker, "worker-a"), Some(ScriptStatus::New));
        assert_eq!(status_of(&tracker, "worker-b"), Some(ScriptStatus::New));
    }

    #[test]
    fn test_tracked_without_process_fails_untracked_is_new() {
        let mut tracker = ScriptTracker::new(120, Box::new(LogAlert::default()));
        let registry = StaticRegistry::default();

        tracker.reconcile(&scripts(&["worker-a"]), &registry);
        tracker.reconcile(&scripts(&["worker-a", "worker-c"]), &registry);

        assert_eq!(status_of(&tracker, "worker-a"), Some(ScriptStatus::Failed));
        assert_eq!(status_of(&tracker, "worker-c"), Some(ScriptStatus::New));
    }

    #[test]
    fn test_running_and_fixed_point() {
        let mut tracker = ScriptTracker::new(120, Box::new(LogAlert::default()));
        let registry = StaticRegistry::default().with("worker-a", &[10]);
        let configured = scripts(&["worker-a", "worker-b"]);

        tracker.reconcile(&configured, &registry);
        tracker.reconcile(&configured, &registry);
        let first = tracker.snapshot();
        tracker.reconcile(&configured, &registry);
        let second = tracker.snapshot();

        assert_eq!(status_of(&tracker, "worker-a"), Some(ScriptStatus::Running));
        assert_eq!(status_of(&tracker, "worker-b"), Some(ScriptStatus::Failed));
        let statuses = |s: &[TrackedScript]| s.iter().map(|t| t.status).collect::<Vec<_>>();
        assert_eq!(statuses(&first), statuses(&second));
    }

    #[test]
    fn test_failed_and_running_oscillate() {
        let mut tracker = ScriptTracker::new(120, Box::new(LogAlert::default()));
        let configured = scripts(&["worker-a"]);
        let dead = StaticRegistry::default();
        let alive = StaticRegistry::default().with("worker-a", &[10]);

        tracker.reconcile(&configured, &dead);
        tracker.reconcile(&configured, &dead);
        assert_eq!(status_of(&tracker, "worker-a"), Some(ScriptStatus::Failed));
        tracker.reconcile(&configured, &alive);
        assert_eq!(status_of(&tracker, "worker-a"), Some(ScriptStatus::Running));
        tracker.reconcile(&configured, &dead);
        assert_eq!(status_of(&tracker, "worker-a"), Some(ScriptStatus::Failed));
    }

    #[test]
    fn test_removed_script_stops_then_pruned_at_alert() {
        let alert = RecordingAlert::default();
        let mut tracker = ScriptTracker::new(5, Box::new(alert.clone()));
        let registry = StaticRegistry::default().with("worker-a", &[10]).with("worker-b", &[11]);

        // run_count: 1 (seed)
        tracker.reconcile(&scripts(&["worker-a", "worker-b"]), &registry);
        // run_count: 2 (alert; nothing stopped yet)
        tracker.reconcile(&scripts(&["worker-a", "worker-b"]), &registry);
        assert_eq!(alert.calls.borrow().len(), 1);

        // run_count: 3, worker-b removed
        tracker.reconcile(&scripts(&["worker-a"]), &registry);
        assert_eq!(status_of(&tracker, "worker-b"), Some(ScriptStatus::Stopped));

        // run_count: 4, 0, 1 - still stopped, still tracked
        for _ in 0..3 {
            tracker.reconcile(&scripts(&["worker-a"]), &registry);
        }
        assert_eq!(status_of(&tracker, "worker-b"), Some(ScriptStatus::Stopped));

        // run_count: 2 - alert sees it, then it is pruned
        tracker.reconcile(&scripts(&["worker-a"]), &registry);
        let calls = alert.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].iter().any(|t| t.script.command == "worker-b" && t.status == ScriptStatus::Stopped));
        assert_eq!(status_of(&tracker, "worker-b"), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_small_interval_is_raised() {
        let alert = RecordingAlert::default();
        let mut tracker = ScriptTracker::new(1, Box::new(alert.clone()));
        let registry = StaticRegistry::default();
        for _ in 0..3 {
            tracker.reconcile(&scripts(&["worker-a"]), &registry);
        }
        assert_eq!(alert.calls.borrow().len(), 1);
    }

    #[test]
    fn test_snapshot_sorted_by_command() {
        let mut tracker = ScriptTracker::new(120, Box::new(LogAlert::default()));
        tracker.reconcile(&scripts(&["worker-c", "worker-a", "worker-b"]), &StaticRegistry::default());
        let commands: Vec<_> = tracker.snapshot().into_iter().map(|t| t.script.command).collect();
        assert_eq!(commands, vec!["worker-a", "worker-b", "worker-c"]);
        assert!(!tracker.is_empty());
    }
}
