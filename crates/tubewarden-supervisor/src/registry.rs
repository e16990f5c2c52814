//! Process table queries and termination.
//!
//! Liveness is never tracked through remembered child handles. Every question
//! ("is this script running?", "which pids run it?") is answered by reading the
//! process table again. [`ProcTable`] reads `/proc/<pid>/cmdline` directly,
//! so a query never spawns a helper process.
//!
//! A failed query degrades to "no matches": the supervisor then tries to start
//! the script, and any duplicate this creates is pruned on the next cycle.

use std::io::Read;
use std::path::{Path, PathBuf};

use nix::sys::signal::{Signal, kill};
use tracing::{debug, warn};
use tubewarden_core::{Pid, Result, WardenError, WorkerScript};

/// Default mount point of the process filesystem.
pub const PROC_ROOT: &str = "/proc";

/// Query and signal operating system processes by command line.
pub trait ProcessRegistry {
    /// Pids whose command line matches `script`, sorted ascending.
    ///
    /// Returns an empty list when nothing matches or the table cannot be read.
    fn find_processes(&self, script: &WorkerScript) -> Vec<Pid>;

    /// Send a non-catchable kill signal. Does not wait for the process to exit.
    fn terminate(&self, pid: Pid) -> Result<()>;

    /// Other supervisor daemons: the same executable, not running a one-shot
    /// subcommand. Sorted ascending.
    fn self_pids(&self, exclude: Pid) -> Vec<Pid>;
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process id
    pub pid: Pid,
    /// Argument vector (argv[0] first)
    pub argv: Vec<String>,
}

/// [`ProcessRegistry`] backed by the `/proc` filesystem.
///
/// A process runs a script when its argv is the script's words, optionally
/// preceded by an interpreter: the configured one, or the one named on the
/// script's `#!` line (which the kernel puts in front of the script path).
/// The interpreter is compared by file name, so `/usr/bin/php` and
/// `/usr/local/bin/php` both count, while `vim /opt/w.php goods` never does.
#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
    /// File name of the configured interpreter
    interpreter: Option<String>,
    self_argv: Vec<String>,
    self_exe: Option<PathBuf>,
}

impl ProcTable {
    /// Registry over the live `/proc`.
    pub fn new(interpreter: Option<&Path>) -> Self {
        Self::with_root(PROC_ROOT, interpreter)
    }

    /// Registry over an arbitrary proc-style directory.
    pub fn with_root(root: impl Into<PathBuf>, interpreter: Option<&Path>) -> Self {
        let root = root.into();
        let self_dir = root.join("self");
        Self {
            self_argv: read_cmdline(&self_dir).unwrap_or_default(),
            self_exe: read_exe(&self_dir),
            interpreter: interpreter.and_then(file_name),
            root,
        }
    }

    /// Read every process entry that has a non-empty command line.
    ///
    /// Kernel threads and processes that exit mid-scan are skipped.
    pub fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| WardenError::ProcessQuery {
            message: format!("cannot read {}: {}", self.root.display(), e),
        })?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<Pid>().ok()) else {
                continue;
            };
            match read_cmdline(&entry.path()) {
                Some(argv) if !argv.is_empty() => processes.push(ProcessEntry { pid, argv }),
                _ => {}
            }
        }
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    /// Interpreter file name a running `script` shows as argv[0], if any.
    fn expected_interpreter(&self, words: &[&str]) -> Option<String> {
        match &self.interpreter {
            Some(name) => Some(name.clone()),
            None => words.first().and_then(|path| shebang_interpreter(Path::new(path))),
        }
    }

    fn snapshot_or_empty(&self) -> Vec<ProcessEntry> {
        self.snapshot().unwrap_or_else(|e| {
            warn!(error = %e, "process table query failed, assuming no processes");
            Vec::new()
        })
    }

    /// Returns true if `entry` is the same executable as this process.
    fn same_executable(&self, entry: &ProcessEntry) -> bool {
        let exe = read_exe(&self.root.join(entry.pid.to_string()));
        match (&self.self_exe, exe) {
            (Some(own), Some(other)) => *own == other,
            _ => {
                let name = |argv: &[String]| argv.first().and_then(|a| file_name(Path::new(a)));
                name(&self.self_argv[..]).is_some() && name(&self.self_argv[..]) == name(&entry.argv[..])
            }
        }
    }
}

impl ProcessRegistry for ProcTable {
    fn find_processes(&self, script: &WorkerScript) -> Vec<Pid> {
        let words = script.words();
        let interpreter = self.expected_interpreter(&words);
        self.snapshot_or_empty()
            .into_iter()
            .filter(|p| runs_script(&p.argv, &words, interpreter.as_deref()))
            .map(|p| p.pid)
            .collect()
    }

    fn terminate(&self, pid: Pid) -> Result<()> {
        // pid 0 would signal our own process group
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or_else(|| WardenError::ProcessSignal {
                pid,
                message: "invalid pid".to_string(),
            })?;

        kill(nix::unistd::Pid::from_raw(raw), Signal::SIGKILL).map_err(|errno| {
            WardenError::ProcessSignal {
                pid,
                message: errno.to_string(),
            }
        })?;
        debug!(pid, "sent SIGKILL");
        Ok(())
    }

    fn self_pids(&self, exclude: Pid) -> Vec<Pid> {
        if self.self_argv.is_empty() {
            return Vec::new();
        }
        self.snapshot_or_empty()
            .into_iter()
            .filter(|p| p.pid != exclude && is_daemon_invocation(&p.argv) && self.same_executable(p))
            .map(|p| p.pid)
            .collect()
    }
}

/// Returns true if `argv` runs exactly `words`, directly or through `interpreter`.
///
/// The interpreter may carry one option word of its own (`#!/bin/sh -e`).
fn runs_script(argv: &[String], words: &[&str], interpreter: Option<&str>) -> bool {
    if words.is_empty() || argv.len() < words.len() {
        return false;
    }
    let (prefix, args) = argv.split_at(argv.len() - words.len());
    if !args.iter().zip(words).all(|(a, w)| a == w) {
        return false;
    }
    match (prefix, interpreter) {
        ([], _) => true,
        ([program, rest @ ..], Some(expected)) if rest.len() <= 1 => {
            file_name(Path::new(program)).as_deref() == Some(expected)
        }
        _ => false,
    }
}

/// Subcommands that inspect and exit instead of supervising.
const ONE_SHOT_COMMANDS: &[&str] = &["status", "validate", "help"];

/// Options of the binary that consume the following word.
const OPTIONS_WITH_VALUE: &[&str] = &["-c", "--config", "--log-dir"];

/// Returns true unless `argv` names a one-shot subcommand. No subcommand means `daemon`.
fn is_daemon_invocation(argv: &[String]) -> bool {
    let mut words = argv.iter().skip(1);
    while let Some(word) = words.next() {
        if OPTIONS_WITH_VALUE.contains(&word.as_str()) {
            words.next();
        } else if word == "--help" || word == "-h" || word == "--version" || word == "-V" {
            return false;
        } else if !word.starts_with('-') {
            return !ONE_SHOT_COMMANDS.contains(&word.as_str());
        }
    }
    true
}

/// Interpreter named on the `#!` line of `script`, as the file name it runs under.
///
/// `#!/usr/bin/env php` resolves to `php`, since env execs the named program.
fn shebang_interpreter(script: &Path) -> Option<String> {
    let mut head = [0u8; 256];
    let n = std::fs::File::open(script).and_then(|mut f| f.read(&mut head)).ok()?;
    let line = head[..n].strip_prefix(b"#!")?;
    let line = line.split(|b| *b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;

    let mut words = line.split_whitespace();
    let program = file_name(Path::new(words.next()?))?;
    if program == "env" {
        return words.find(|w| !w.starts_with('-')).and_then(|w| file_name(Path::new(w)));
    }
    Some(program)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Target of `<dir>/exe`, without the marker the kernel adds once the binary is replaced.
fn read_exe(dir: &Path) -> Option<PathBuf> {
    let target = std::fs::read_link(dir.join("exe")).ok()?;
    let target = target.to_string_lossy();
    Some(PathBuf::from(target.strip_suffix(" (deleted)").unwrap_or(&target)))
}

/// Parse `<dir>/cmdline` into an argument vector.
fn read_cmdline(dir: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read(dir.join("cmdline")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect(),
    )
}

/// Resident memory of the current process in MiB, read from `/proc/self/status`.
pub fn resident_memory_mb() -> Option<f64> {
    let content = std::fs::read_to_string(Path::new(PROC_ROOT).join("self/status")).ok()?;
    parse_vm_rss_kb(&content).map(|kb| kb as f64 / 1024.0)
}

/// Extract `VmRSS` (kB) from a `/proc/<pid>/status` document.
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}
