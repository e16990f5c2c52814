//! tubewarden - keeps queue worker scripts running
//!
//! ## Usage
//!
//! ```bash
//! # Run the supervisor (default command)
//! tubewarden
//!
//! # With verbose logging and an explicit configuration file
//! tubewarden -v --config /etc/tubewarden/config.yaml daemon
//!
//! # Show the state of every configured script
//! tubewarden status
//!
//! # Check the configuration file
//! tubewarden validate
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tubewarden_config::{ConfigLoader, WardenConfig, default_config_path};
use tubewarden_core::{LogGuard, WardenError, init_logging};
use tubewarden_supervisor::{ForkExecLauncher, LogAlert, ProcTable, Supervisor, apply_timezone};

/// Supervisor for long-running queue worker scripts
///
/// Re-reads the configured script list every polling interval, starts scripts
/// that are not running, kills duplicates and removed scripts, and restarts
/// every worker periodically.
#[derive(Parser, Debug)]
#[command(name = "tubewarden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.tubewarden/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Configuration file (defaults to ~/.tubewarden/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the supervisor loop (default)
    Daemon,
    /// Print the status of every configured script and exit
    Status,
    /// Load and validate the configuration file
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let loader = match config_path(&cli) {
        Ok(path) => ConfigLoader::new(path),
        Err(e) => return report_error(&e),
    };

    match cli.command.unwrap_or(Command::Daemon) {
        Command::Validate => validate(&loader),
        Command::Status => status(&cli, &loader),
        Command::Daemon => daemon(&cli, loader),
    }
}

fn config_path(cli: &Cli) -> tubewarden_core::Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => default_config_path(),
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> tubewarden_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

fn report_error(err: &WardenError) -> ExitCode {
    eprintln!("Error: {err}");
    if let Some(hint) = err.guidance() {
        eprintln!("Hint: {hint}");
    }
    ExitCode::from(1)
}

fn load_config(loader: &ConfigLoader) -> Result<WardenConfig, ExitCode> {
    loader.load().map_err(|e| report_error(&e))
}

fn build_supervisor(loader: &ConfigLoader, config: &WardenConfig) -> Supervisor<ProcTable, ForkExecLauncher> {
    Supervisor::new(
        ProcTable::new(config.interpreter.as_deref()),
        ForkExecLauncher::new(config.interpreter.clone()),
        Box::new(loader.clone()),
        config.daemon.clone(),
        Box::new(LogAlert::new(config.alert_recipients.clone())),
    )
}

fn daemon(cli: &Cli, loader: ConfigLoader) -> ExitCode {
    let config = match load_config(&loader) {
        Ok(config) => config,
        Err(code) => return code,
    };

    // TZ must be set before the runtime spawns any thread.
    apply_timezone(&config.daemon.timezone);

    let _guard = match setup_logging(cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    info!(config = %loader.path().display(), "starting tubewarden supervisor");
    let mut supervisor = build_supervisor(&loader, &config);

    match runtime.block_on(supervisor.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(WardenError::AlreadyRunning { pid }) => {
            info!(pid, "another supervisor is running, exiting");
            println!("{}", WardenError::AlreadyRunning { pid });
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("tubewarden supervisor error: {}", e);
            report_error(&e)
        }
    }
}

fn status(cli: &Cli, loader: &ConfigLoader) -> ExitCode {
    let config = match load_config(loader) {
        Ok(config) => config,
        Err(code) => return code,
    };
    apply_timezone(&config.daemon.timezone);
    let _guard = setup_logging(cli).ok();

    let supervisor = build_supervisor(loader, &config);
    print!("{}", supervisor.report_for(&config.scripts()));
    ExitCode::SUCCESS
}

fn validate(loader: &ConfigLoader) -> ExitCode {
    let config = match load_config(loader) {
        Ok(config) => config,
        Err(code) => return code,
    };

    println!("Configuration OK: {}", loader.path().display());
    println!("  scripts:        {}", config.scripts().len());
    println!("  channel-groups: {}", config.subscribers.len());
    for (group, subscribers) in &config.subscribers {
        println!("    {group}: {}", subscribers.join(", "));
    }
    println!("  queue server:   {}", config.beanstalkd.address());
    ExitCode::SUCCESS
}
