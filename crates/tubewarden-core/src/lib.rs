//! # tubewarden-core
//!
//! Core types, errors, and utilities shared by the tubewarden crates.
//!
//! This crate provides:
//! - [`WardenError`] - Error type for every supervisor and queue operation
//! - [`logging`] - Tracing setup and log directory helpers
//! - [`types`] - Worker script identity, script status and channel naming
//!
//! ## Example
//!
//! ```no_run
//! use tubewarden_core::{WardenError, WorkerScript, logging};
//!
//! fn main() -> tubewarden_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!
//!     let script = WorkerScript::new("/opt/workers/solr_watch.php goods");
//!     tracing::info!(script = %script, id = %script.id, "tracking script");
//!
//!     Err(WardenError::unknown_channel("goods", Some("solr")))
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use error::{Result, WardenError};
pub use logging::{LogGuard, init_logging};
pub use types::{Channel, Pid, ScriptId, ScriptStatus, WorkerScript};
