//! Worker script supervision for tubewarden.
//!
//! Keeps every configured worker script running as exactly one OS process.
//!
//! # Overview
//!
//! - [`ProcessRegistry`] answers "which pids run this command line?" from the
//!   live process table and delivers `SIGKILL`
//! - [`Launcher`] starts a script with fork + exec, keeping no child handle
//! - [`ScriptTracker`] derives new / running / failed / stopped statuses and
//!   fires a grouped alert once per alert window
//! - [`Supervisor`] owns the poll loop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  load_scripts   ┌──────────────┐
//! │ ScriptSource │ ◄────────────── │  Supervisor  │
//! └──────────────┘                 └──────┬───────┘
//!                       ┌─────────────────┼─────────────────┐
//!                       ▼                 ▼                 ▼
//!               ┌──────────────┐  ┌───────────────┐  ┌──────────────┐
//!               │ScriptTracker │  │ProcessRegistry│  │   Launcher   │
//!               └──────────────┘  └───────────────┘  └──────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tubewarden_config::{ConfigLoader, DaemonConfig};
//! use tubewarden_supervisor::{ForkExecLauncher, LogAlert, ProcTable, Supervisor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> tubewarden_core::Result<()> {
//!     let mut supervisor = Supervisor::new(
//!         ProcTable::new(None),
//!         ForkExecLauncher::new(None),
//!         Box::new(ConfigLoader::new("/etc/tubewarden/config.yaml")),
//!         DaemonConfig::default(),
//!         Box::new(LogAlert::default()),
//!     );
//!     supervisor.run().await
//! }
//! ```

pub mod daemon;
pub mod launcher;
pub mod registry;
pub mod report;
pub mod tracker;

pub use daemon::{Supervisor, SupervisorState, apply_timezone};
pub use launcher::{EXEC_FAILURE_STATUS, ForkExecLauncher, Launcher};
pub use registry::{ProcTable, ProcessEntry, ProcessRegistry};
pub use report::{ScriptLine, StatusReport};
pub use tracker::{AlertHook, LogAlert, ScriptTracker, TrackedScript};
