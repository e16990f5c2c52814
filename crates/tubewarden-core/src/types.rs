//! Shared type definitions used across tubewarden crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating system process identifier.
pub type Pid = u32;

/// Stable identity of a worker script: the MD5 hex digest of its command line.
///
/// The digest survives supervisor restarts, so the same configuration entry
/// always maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(String);

impl ScriptId {
    /// Derive the id for a command line.
    pub fn of(command: &str) -> Self {
        Self(format!("{:x}", md5::compute(command.as_bytes())))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured worker script.
///
/// The exact command line is the primary key for all process matching: two
/// entries differing only in arguments are different scripts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerScript {
    /// Content hash of `command`
    pub id: ScriptId,
    /// Launch command line (script path plus arguments)
    pub command: String,
}

impl WorkerScript {
    /// Create a script from its command line. Surrounding whitespace is ignored.
    pub fn new(command: impl AsRef<str>) -> Self {
        let command = command.as_ref().trim().to_string();
        Self {
            id: ScriptId::of(&command),
            command,
        }
    }

    /// The command line split into argument words.
    pub fn words(&self) -> Vec<&str> {
        self.command.split_whitespace().collect()
    }
}

impl fmt::Display for WorkerScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

/// Status of a tracked worker script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    /// First seen this cycle, no liveness verdict yet
    #[default]
    New,
    /// A matching process was observed
    Running,
    /// Configured and previously tracked, but no process was observed
    Failed,
    /// Removed from the configuration; pruned at the next alert
    Stopped,
}

impl ScriptStatus {
    /// Returns true for statuses operators should be alerted about.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One physical queue channel: a subscriber under a channel-group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Channel-group (topic) name
    pub group: String,
    /// Subscriber identity within the group
    pub subscriber: String,
}

impl Channel {
    /// Create a channel for `group` / `subscriber`.
    pub fn new(group: impl Into<String>, subscriber: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            subscriber: subscriber.into(),
        }
    }

    /// Name of the underlying tube: `group.subscriber`.
    pub fn tube(&self) -> String {
        format!("{}.{}", self.group, self.subscriber)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.subscriber)
    }
}
