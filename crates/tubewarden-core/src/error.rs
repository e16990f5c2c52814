//! Error types for tubewarden operations.
//!
//! [`WardenError`] covers every failure the supervisor, the queue consumer and
//! the queue producer can observe. Only [`WardenError::AlreadyRunning`] is
//! allowed to end a process; everything else is logged and the owning loop
//! carries on.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Pid;

/// Result type alias using [`WardenError`].
pub type Result<T> = std::result::Result<T, WardenError>;

/// Error type for all tubewarden operations.
#[derive(Debug, Error)]
pub enum WardenError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    /// A channel-group or subscriber that is not in the subscriber map
    #[error("{}", unknown_channel_message(.group, .subscriber))]
    UnknownChannel {
        group: String,
        subscriber: Option<String>,
    },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Queue transport operation failed
    #[error("Transport {operation} failed: {message}")]
    Transport { operation: String, message: String },

    // =========================================================================
    // Process Control Errors
    // =========================================================================
    /// Process table could not be read
    #[error("Process table query failed: {message}")]
    ProcessQuery { message: String },

    /// Signal delivery failed
    #[error("Failed to signal pid {pid}: {message}")]
    ProcessSignal { pid: Pid, message: String },

    /// Worker script could not be launched
    #[error("Failed to launch '{script}': {message}")]
    Launch { script: String, message: String },

    // =========================================================================
    // Startup Errors
    // =========================================================================
    /// Another supervisor instance already manages the fleet
    #[error("Supervisor already running, pid is: {pid}")]
    AlreadyRunning { pid: Pid },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("JSON error in {context}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in tubewarden)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn unknown_channel_message(group: &str, subscriber: &Option<String>) -> String {
    match subscriber {
        Some(subscriber) => {
            format!("Subscriber '{subscriber}' is not allowed to access channel-group '{group}'")
        }
        None => format!("Channel-group '{group}' is not configured"),
    }
}

impl WardenError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an UnknownChannel error
    pub fn unknown_channel(group: impl Into<String>, subscriber: Option<&str>) -> Self {
        Self::UnknownChannel {
            group: group.into(),
            subscriber: subscriber.map(str::to_string),
        }
    }

    /// Create a transport error
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a launch error
    pub fn launch(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Launch {
            script: script.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON error
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if this error must terminate the process.
    ///
    /// A second supervisor would double-manage the fleet, so this is the only
    /// fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigValidation { .. }
                | Self::UnknownChannel { .. }
        )
    }

    /// Returns true if this is a queue transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns true if this is a process query/signal/launch error
    pub fn is_process_error(&self) -> bool {
        matches!(
            self,
            Self::ProcessQuery { .. } | Self::ProcessSignal { .. } | Self::Launch { .. }
        )
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Create the configuration file or pass --config with its path")
            }
            Self::ConfigInvalid { .. } => {
                Some("Check YAML syntax - try 'tubewarden validate' to see detailed errors")
            }
            Self::UnknownChannel { .. } => {
                Some("Add the channel-group and subscriber under 'subscribers' in the configuration")
            }
            Self::AlreadyRunning { .. } => {
                Some("Stop the running supervisor first, or leave it in charge")
            }
            Self::Launch { .. } => Some("Check the script path and the configured interpreter"),
            Self::Transport { .. } => Some("Check that the queue server is reachable"),
            _ => None,
        }
    }
}
