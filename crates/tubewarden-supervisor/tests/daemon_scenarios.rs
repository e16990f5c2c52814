//! Supervisor scenarios against an in-memory process table.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tubewarden_config::{DaemonConfig, ScriptSource};
use tubewarden_core::{Pid, Result, ScriptStatus, WardenError, WorkerScript};
use tubewarden_supervisor::{Launcher, LogAlert, ProcessRegistry, Supervisor};

/// Shared fake OS: command line -> running pids.
#[derive(Default)]
struct FakeOs {
    processes: BTreeMap<String, Vec<Pid>>,
    other_supervisors: Vec<Pid>,
    killed: Vec<Pid>,
    launched: Vec<(String, Pid)>,
    next_pid: Pid,
    child_exit_ignored: bool,
    fail_launch: bool,
}

#[derive(Clone, Default)]
struct Fake(Rc<RefCell<FakeOs>>);

impl Fake {
    fn with_process(self, command: &str, pid: Pid) -> Self {
        self.0
            .borrow_mut()
            .processes
            .entry(command.to_string())
            .or_default()
            .push(pid);
        self
    }

    fn pids(&self, command: &str) -> Vec<Pid> {
        self.0.borrow().processes.get(command).cloned().unwrap_or_default()
    }

    fn crash(&self, command: &str) {
        self.0.borrow_mut().processes.remove(command);
    }

    fn killed(&self) -> Vec<Pid> {
        self.0.borrow().killed.clone()
    }

    fn launches(&self, command: &str) -> usize {
        self.0.borrow().launched.iter().filter(|(c, _)| c == command).count()
    }
}

impl ProcessRegistry for Fake {
    fn find_processes(&self, script: &WorkerScript) -> Vec<Pid> {
        let mut pids = self.pids(&script.command);
        pids.sort_unstable();
        pids
    }

    fn terminate(&self, pid: Pid) -> Result<()> {
        let mut os = self.0.borrow_mut();
        os.killed.push(pid);
        for pids in os.processes.values_mut() {
            pids.retain(|p| *p != pid);
        }
        Ok(())
    }

    fn self_pids(&self, exclude: Pid) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .0
            .borrow()
            .other_supervisors
            .iter()
            .copied()
            .filter(|p| *p != exclude)
            .collect();
        pids.sort_unstable();
        pids
    }
}

impl Launcher for Fake {
    fn ignore_child_exit(&self) -> Result<()> {
        self.0.borrow_mut().child_exit_ignored = true;
        Ok(())
    }

    fn launch(&self, script: &WorkerScript) -> Result<Pid> {
        let mut os = self.0.borrow_mut();
        if os.fail_launch {
            return Err(WardenError::launch(&script.command, "fork failed"));
        }
        os.next_pid += 1;
        let pid = 1000 + os.next_pid;
        os.processes.entry(script.command.clone()).or_default().push(pid);
        os.launched.push((script.command.clone(), pid));
        Ok(pid)
    }
}

/// Script list that tests can edit between cycles.
#[derive(Clone, Default)]
struct EditableSource {
    scripts: Rc<RefCell<Option<Vec<String>>>>,
}

impl EditableSource {
    fn set(&self, commands: &[&str]) {
        *self.scripts.borrow_mut() = Some(commands.iter().map(|c| c.to_string()).collect());
    }

    fn break_config(&self) {
        *self.scripts.borrow_mut() = None;
    }
}

impl ScriptSource for EditableSource {
    fn load_scripts(&self) -> Result<Vec<WorkerScript>> {
        self.scripts
            .borrow()
            .as_ref()
            .map(|commands| commands.iter().map(WorkerScript::new).collect())
            .ok_or_else(|| WardenError::validation("broken configuration"))
    }
}

fn supervisor(fake: &Fake, source: &EditableSource, alert_interval_cycles: u32) -> Supervisor<Fake, Fake> {
    let options = DaemonConfig {
        alert_interval_cycles,
        ..DaemonConfig::default()
    };
    Supervisor::new(
        fake.clone(),
        fake.clone(),
        Box::new(source.clone()),
        options,
        Box::new(LogAlert::default()),
    )
}

fn status(sup: &Supervisor<Fake, Fake>, command: &str) -> Option<ScriptStatus> {
    sup.tracker().status(&WorkerScript::new(command).id)
}

#[test]
fn startup_kills_every_configured_process() {
    let fake = Fake::default()
        .with_process("worker-a", 10)
        .with_process("worker-a", 11)
        .with_process("worker-b", 20)
        .with_process("unrelated", 30);
    let source = EditableSource::default();
    source.set(&["worker-a", "worker-b"]);

    let mut sup = supervisor(&fake, &source, 120);
    sup.start().unwrap();

    let mut killed = fake.killed();
    killed.sort_unstable();
    assert_eq!(killed, vec![10, 11, 20]);
    assert_eq!(fake.pids("unrelated"), vec![30]);
    assert!(fake.0.borrow().child_exit_ignored);
}

#[test]
fn second_instance_refuses_to_start() {
    let fake = Fake::default().with_process("worker-a", 10);
    fake.0.borrow_mut().other_supervisors = vec![77, 55];
    let source = EditableSource::default();
    source.set(&["worker-a"]);

    let mut sup = supervisor(&fake, &source, 120);
    let err = sup.start().unwrap_err();

    assert!(matches!(err, WardenError::AlreadyRunning { pid: 55 }));
    assert!(err.is_fatal());
    assert!(fake.killed().is_empty());
    assert!(!fake.0.borrow().child_exit_ignored);
}

#[test]
fn failed_script_is_restarted_exactly_once() {
    let fake = Fake::default();
    let source = EditableSource::default();
    source.set(&["worker-a"]);
    let mut sup = supervisor(&fake, &source, 120);
    sup.start().unwrap();

    sup.run_cycle();
    assert_eq!(status(&sup, "worker-a"), Some(ScriptStatus::New));
    assert_eq!(fake.launches("worker-a"), 1);

    fake.crash("worker-a");
    sup.run_cycle();
    assert_eq!(status(&sup, "worker-a"), Some(ScriptStatus::Failed));
    assert_eq!(fake.launches("worker-a"), 2);
    assert_eq!(fake.pids("worker-a").len(), 1);

    sup.run_cycle();
    assert_eq!(status(&sup, "worker-a"), Some(ScriptStatus::Running));
    assert_eq!(fake.launches("worker-a"), 2);
}

#[test]
fn duplicates_are_pruned_to_the_largest_pid() {
    let fake = Fake::default();
    let source = EditableSource::default();
    source.set(&["worker-a"]);
    let mut sup = supervisor(&fake, &source, 120);
    sup.start().unwrap();

    let fake = fake.with_process("worker-a", 30).with_process("worker-a", 10).with_process("worker-a", 20);
    sup.run_cycle();

    assert_eq!(fake.pids("worker-a"), vec![30]);
    let mut killed = fake.killed();
    killed.sort_unstable();
    assert_eq!(killed, vec![10, 20]);
    assert_eq!(fake.launches("worker-a"), 0);
    assert_eq!(sup.state().observed[&WorkerScript::new("worker-a").id], vec![30]);
}

#[test]
fn removed_script_is_killed_stopped_then_pruned() {
    let fake = Fake::default();
    let source = EditableSource::default();
    source.set(&["worker-a", "worker-b"]);
    let mut sup = supervisor(&fake, &source, 3);
    sup.start().unwrap();

    sup.run_cycle(); // seed
    sup.run_cycle(); // alert tick, both running
    assert_eq!(status(&sup, "worker-b"), Some(ScriptStatus::Running));
    let worker_b = fake.pids("worker-b");
    assert_eq!(worker_b.len(), 1);

    source.set(&["worker-a"]);
    sup.run_cycle();
    assert!(fake.pids("worker-b").is_empty());
    assert!(fake.killed().contains(&worker_b[0]));
    assert_eq!(status(&sup, "worker-b"), Some(ScriptStatus::Stopped));

    sup.run_cycle();
    assert_eq!(status(&sup, "worker-b"), Some(ScriptStatus::Stopped));
    sup.run_cycle(); // next alert tick
    assert_eq!(status(&sup, "worker-b"), None);
    assert_eq!(status(&sup, "worker-a"), Some(ScriptStatus::Running));
}

#[test]
fn broken_reload_keeps_previous_scripts() {
    let fake = Fake::default();
    let source = EditableSource::default();
    source.set(&["worker-a"]);
    let mut sup = supervisor(&fake, &source, 120);
    sup.start().unwrap();
    sup.run_cycle();

    source.break_config();
    fake.crash("worker-a");
    sup.run_cycle();

    assert_eq!(sup.state().current_scripts, vec![WorkerScript::new("worker-a")]);
    assert_eq!(fake.launches("worker-a"), 2);
}

#[test]
fn launch_failure_does_not_stop_the_cycle() {
    let fake = Fake::default();
    fake.0.borrow_mut().fail_launch = true;
    let source = EditableSource::default();
    source.set(&["worker-a", "worker-b"]);
    let mut sup = supervisor(&fake, &source, 120);
    sup.start().unwrap();

    sup.run_cycle();
    sup.run_cycle();

    assert_eq!(status(&sup, "worker-a"), Some(ScriptStatus::Failed));
    assert_eq!(status(&sup, "worker-b"), Some(ScriptStatus::Failed));
    assert!(sup.state().observed.is_empty());
}

#[test]
fn periodic_restart_kills_everything() {
    let fake = Fake::default();
    let source = EditableSource::default();
    source.set(&["worker-a"]);

    let mut patient = supervisor(&fake, &source, 120);
    patient.start().unwrap();
    patient.run_cycle();
    assert!(!patient.check_restart());
    assert_eq!(fake.pids("worker-a").len(), 1);

    let options = DaemonConfig {
        restart_interval_secs: 0,
        ..DaemonConfig::default()
    };
    let mut eager = Supervisor::new(
        fake.clone(),
        fake.clone(),
        Box::new(source.clone()),
        options,
        Box::new(LogAlert::default()),
    );
    eager.start().unwrap();
    eager.run_cycle();
    assert!(eager.check_restart());
    assert!(fake.pids("worker-a").is_empty());

    eager.run_cycle();
    assert_eq!(fake.pids("worker-a").len(), 1);
}

#[test]
fn status_report_shows_lowest_pid_and_waiting_scripts() {
    let fake = Fake::default().with_process("worker-a", 42).with_process("worker-a", 41);
    let source = EditableSource::default();
    let sup = supervisor(&fake, &source, 120);

    let report = sup.report_for(&[WorkerScript::new("worker-a"), WorkerScript::new("worker-b")]);
    assert_eq!(report.scripts[0].pid, Some(41));
    assert_eq!(report.scripts[1].pid, None);
    assert_eq!(report.running(), 1);

    let text = report.to_string();
    assert!(text.contains("[pid: 41]"));
    assert!(text.contains("[awaking...]"));
}
