//! Starting worker scripts.
//!
//! The supervisor forks and the child replaces itself with the worker image.
//! No child handle is kept and no exit status is collected: with `SIGCHLD`
//! ignored the kernel reaps finished children, and liveness is re-derived from
//! the process table each cycle.

use std::ffi::{CString, NulError, c_char};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, fork};
use tracing::debug;
use tubewarden_core::{Pid, Result, WardenError, WorkerScript};

/// Exit status of a child whose exec failed.
pub const EXEC_FAILURE_STATUS: i32 = 127;

/// Starts worker processes.
pub trait Launcher {
    /// Stop the supervisor from accumulating zombie children.
    fn ignore_child_exit(&self) -> Result<()>;

    /// Start `script` in a new process and return its pid.
    ///
    /// Failures after the process has been created (a bad path, a missing
    /// interpreter) end that child only; they are not reported here.
    fn launch(&self, script: &WorkerScript) -> Result<Pid>;
}

/// [`Launcher`] using `fork(2)` + `execvp(3)`.
#[derive(Debug, Clone, Default)]
pub struct ForkExecLauncher {
    interpreter: Option<PathBuf>,
}

impl ForkExecLauncher {
    /// Create a launcher, optionally running every script through `interpreter`.
    pub fn new(interpreter: Option<PathBuf>) -> Self {
        Self { interpreter }
    }
}

impl Launcher for ForkExecLauncher {
    fn ignore_child_exit(&self) -> Result<()> {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }
            .map(|_| ())
            .map_err(|errno| WardenError::ProcessSignal {
                pid: std::process::id(),
                message: format!("cannot ignore SIGCHLD: {errno}"),
            })
    }

    fn launch(&self, script: &WorkerScript) -> Result<Pid> {
        // Everything the child touches is allocated before forking.
        let argv = command_argv(self.interpreter.as_deref(), script)?;
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let failure = format!("tubewarden: execution failure: {}\n", script.command).into_bytes();

        // SAFETY: between fork and exec the child only calls signal(2),
        // execvp(3), write(2) and _exit(2) on memory allocated above; `argv`
        // outlives the pointers in `argv_ptrs`.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(pid = child.as_raw(), script = %script, "forked worker");
                Ok(child.as_raw() as Pid)
            }
            Ok(ForkResult::Child) => unsafe {
                // Ignored dispositions survive exec; workers get the default back.
                let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
                libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
                libc::write(libc::STDERR_FILENO, failure.as_ptr().cast(), failure.len());
                libc::_exit(EXEC_FAILURE_STATUS)
            },
            Err(errno) => Err(WardenError::launch(&script.command, format!("fork failed: {errno}"))),
        }
    }
}

/// Argument vector for `script`: the interpreter (if any) followed by the script words.
pub fn command_argv(interpreter: Option<&Path>, script: &WorkerScript) -> Result<Vec<CString>> {
    let nul_error = |_: NulError| WardenError::launch(&script.command, "argument contains a NUL byte");

    let mut argv = Vec::new();
    if let Some(interpreter) = interpreter {
        argv.push(CString::new(interpreter.as_os_str().as_bytes()).map_err(nul_error)?);
    }
    for word in script.words() {
        argv.push(CString::new(word).map_err(nul_error)?);
    }

    if argv.is_empty() {
        return Err(WardenError::launch(&script.command, "empty command line"));
    }
    Ok(argv)
}
