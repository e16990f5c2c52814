//! Logging setup shared by the supervisor binary and queue workers.
//!
//! Two outputs are installed:
//!
//! - a daily rolling JSON-lines file (`tubewarden.log` by default) with event
//!   fields flattened to the top level, so `script`, `pid`, `channel` and
//!   `subscriber` are directly queryable
//! - compact text on stderr for operators watching the foreground process
//!
//! `RUST_LOG` wins over the built-in level (`info`, or `debug` when verbose).
//!
//! ```no_run
//! use tubewarden_core::logging;
//!
//! let _guard = logging::init_logging(None, false)?;
//! tracing::info!(script = "/opt/workers/solr_watch.php goods", "supervising");
//! # Ok::<(), tubewarden_core::WardenError>(())
//! ```

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{Result, WardenError};

/// Name of the rolling log file inside the log directory.
pub const LOG_FILE_NAME: &str = "tubewarden.log";

/// Flushes the background file writer when dropped.
///
/// Hold it until the process exits, otherwise trailing records are lost.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _writer: WorkerGuard,
}

/// Install the global subscriber writing to `log_dir` (default `~/.tubewarden/logs/`).
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    init_logging_to(log_dir, LOG_FILE_NAME, verbose)
}

/// Like [`init_logging`] with a custom file name, so a worker process can keep
/// its own log next to the supervisor's.
pub fn init_logging_to(log_dir: Option<PathBuf>, file_name: &str, verbose: bool) -> Result<LogGuard> {
    let dir = log_dir.map_or_else(default_log_dir, Ok)?;
    ensure_dir(&dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, file_name));

    let json = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_ansi(false)
        .with_writer(writer);

    let text = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_file(verbose)
        .with_line_number(verbose);

    tracing_subscriber::registry()
        .with(level_filter(verbose))
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| WardenError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(dir = %dir.display(), file = file_name, "logging ready");
    Ok(LogGuard { _writer: guard })
}

/// Stderr-only logging for tests. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(level_filter(true))
        .with_test_writer()
        .try_init();
}

fn level_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|source| WardenError::DirectoryCreation {
        path: dir.to_path_buf(),
        source,
    })
}

/// The tubewarden home directory (`~/.tubewarden/`).
pub fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".tubewarden"))
        .ok_or_else(|| WardenError::internal("HOME is not set"))
}

/// Default log directory (`~/.tubewarden/logs/`).
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_under_home() {
        // SAFETY: the only test in this crate touching HOME
        unsafe { std::env::set_var("HOME", "/tmp/tubewarden-home") };
        assert_eq!(
            default_log_dir().unwrap(),
            PathBuf::from("/tmp/tubewarden-home/.tubewarden/logs")
        );
    }

    #[test]
    fn test_ensure_dir_reports_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = ensure_dir(&file.path().join("logs")).unwrap_err();
        assert!(matches!(err, WardenError::DirectoryCreation { .. }));
    }

    #[test]
    fn test_repeated_test_logging() {
        init_test_logging();
        init_test_logging();
    }
}
