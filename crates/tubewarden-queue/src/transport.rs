//! The queue transport seam.
//!
//! [`Transport`] is the small surface of a tube-based work queue that the
//! consumer and producer rely on. The wire protocol lives behind it;
//! [`MemoryTransport`](crate::memory::MemoryTransport) is the in-process
//! implementation.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tubewarden_core::Result;

/// Queue-assigned job identifier. Never reused once a job is deleted.
pub type JobId = u64;

/// A reserved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Job identifier, valid until the job is deleted or buried
    pub id: JobId,
    /// Opaque payload
    pub body: Vec<u8>,
}

impl Job {
    /// Payload as text, with invalid UTF-8 replaced.
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Server-wide job counters returned by [`Transport::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Jobs waiting to be reserved
    pub ready: usize,
    /// Jobs held by a consumer
    pub reserved: usize,
    /// Jobs waiting for their delay to elapse
    pub delayed: usize,
    /// Parked jobs awaiting operator action
    pub buried: usize,
    /// Jobs ever created
    pub total_jobs: u64,
    /// Open connections
    pub current_connections: usize,
}

/// Connection to a tube-based work queue.
///
/// All operations except [`connect`](Transport::connect) fail with a transport
/// error while disconnected.
#[async_trait]
pub trait Transport: Send {
    /// Open the connection. The used tube resets to `default` and the watch list empties.
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection. Jobs reserved through it become ready again.
    async fn disconnect(&mut self) -> Result<()>;

    /// Returns true while a connection is open.
    fn is_connected(&self) -> bool;

    /// Select the tube that [`put`](Transport::put) writes to.
    async fn use_channel(&mut self, tube: &str) -> Result<()>;

    /// Add a tube to the set [`reserve`](Transport::reserve) reads from.
    async fn watch(&mut self, tube: &str) -> Result<()>;

    /// Enqueue a job on the used tube. Lower priority values are reserved first.
    async fn put(&mut self, priority: u32, delay: Duration, ttr: Duration, body: &[u8]) -> Result<JobId>;

    /// Reserve the next job from the watched tubes.
    ///
    /// `Ok(None)` means nothing arrived before the transport's reserve timeout.
    async fn reserve(&mut self) -> Result<Option<Job>>;

    /// Acknowledge a reserved job, removing it for good.
    async fn delete(&mut self, id: JobId) -> Result<()>;

    /// Park a reserved job. Buried jobs are never handed out again by `reserve`.
    async fn bury(&mut self, id: JobId) -> Result<()>;

    /// Lightweight server status probe.
    async fn stats(&mut self) -> Result<TransportStats>;
}
