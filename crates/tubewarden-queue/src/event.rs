//! Queue event log.
//!
//! Every produce, consume, park, error, empty reservation and reconnect emits
//! a [`QueueEvent`].
//! The [`EventLog`] fans each event out to its sinks: structured `tracing`
//! output always, plus an optional JSON-lines file per channel.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tubewarden_config::EventLogConfig;
use tubewarden_core::{Channel, Result, WardenError};

/// What happened to a message or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOperation {
    /// A job was enqueued
    Product,
    /// A job was handled and deleted
    Consume,
    /// A job was buried for operator attention
    Park,
    /// A transport or acknowledgement failure
    Error,
    /// The consumer re-established its connection
    Reconnect,
    /// A reservation returned no job before its timeout
    Idle,
}

impl std::fmt::Display for EventOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Product => write!(f, "product"),
            Self::Consume => write!(f, "consume"),
            Self::Park => write!(f, "park"),
            Self::Error => write!(f, "error"),
            Self::Reconnect => write!(f, "reconnect"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// One event log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Local>,
    pub operation: EventOperation,
    /// Channel-group name
    pub channel: String,
    pub subscriber: String,
    /// Message body (lossy UTF-8) or error text
    pub payload: String,
}

impl QueueEvent {
    /// Create an event stamped with the current local time.
    pub fn new(operation: EventOperation, channel: &Channel, payload: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            operation,
            channel: channel.group.clone(),
            subscriber: channel.subscriber.clone(),
            payload: payload.into(),
        }
    }
}

/// Destination for queue events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record one event.
    async fn record(&self, event: &QueueEvent) -> Result<()>;
}

/// Writes events through `tracing` under the `tubewarden::queue` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: &QueueEvent) -> Result<()> {
        match event.operation {
            EventOperation::Error => warn!(
                target: "tubewarden::queue",
                operation = %event.operation,
                channel = %event.channel,
                subscriber = %event.subscriber,
                payload = %event.payload,
                "queue event"
            ),
            EventOperation::Idle => debug!(
                target: "tubewarden::queue",
                operation = %event.operation,
                channel = %event.channel,
                subscriber = %event.subscriber,
                payload = %event.payload,
                "queue event"
            ),
            _ => info!(
                target: "tubewarden::queue",
                operation = %event.operation,
                channel = %event.channel,
                subscriber = %event.subscriber,
                payload = %event.payload,
                "queue event"
            ),
        }
        Ok(())
    }
}

/// Appends events as JSON lines to `<dir>/<group>.<subscriber>.log`.
///
/// A file already larger than `max_file_bytes` is truncated before the next write.
#[derive(Debug)]
pub struct FileEventSink {
    dir: PathBuf,
    max_file_bytes: u64,
    write_lock: Mutex<()>,
}

impl FileEventSink {
    /// Create a sink writing under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_file_bytes,
            write_lock: Mutex::new(()),
        }
    }

    /// Log file for a channel.
    pub fn path_for(&self, group: &str, subscriber: &str) -> PathBuf {
        self.dir.join(format!("{group}.{subscriber}.log"))
    }

    async fn oversized(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .is_ok_and(|meta| meta.len() > self.max_file_bytes)
    }
}

#[async_trait]
impl EventSink for FileEventSink {
    async fn record(&self, event: &QueueEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| WardenError::DirectoryCreation {
                path: self.dir.clone(),
                source: e,
            })?;

        let path = self.path_for(&event.channel, &event.subscriber);
        let truncate = self.oversized(&path).await;

        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(&path)
            .await
            .map_err(|e| WardenError::io("opening event log", &path, e))?;

        let json = serde_json::to_string(event).map_err(|e| WardenError::json("queue event", e))?;
        let line = format!("{json}\n");
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| WardenError::io("writing event log", &path, e))?;
        file.flush()
            .await
            .map_err(|e| WardenError::io("flushing event log", &path, e))?;
        Ok(())
    }
}

/// Fans queue events out to every configured sink.
pub struct EventLog {
    sinks: Vec<Box<dyn EventSink>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("sinks", &self.sinks.len()).finish()
    }
}

impl EventLog {
    /// Event log with only the tracing sink.
    pub fn new() -> Self {
        Self {
            sinks: vec![Box::new(TracingEventSink)],
        }
    }

    /// Event log with no sinks.
    pub fn silent() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Tracing sink plus, when `dir` is set, the per-channel file sink.
    pub fn from_config(config: &EventLogConfig) -> Self {
        let log = Self::new();
        match &config.dir {
            Some(dir) => log.with_sink(FileEventSink::new(dir, config.max_file_bytes)),
            None => log,
        }
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Record `event` in every sink. Sink failures are logged, never returned.
    pub async fn emit(&self, event: QueueEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.record(&event).await {
                warn!(error = %e, operation = %event.operation, "event sink failed");
            }
        }
    }
}
