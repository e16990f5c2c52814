//! In-process queue server.
//!
//! [`MemoryBroker`] keeps named tubes with ready, delayed, reserved and buried
//! jobs; every [`MemoryTransport`] created from it is one client connection.
//! Job ids increase monotonically and are never reused.
//!
//! [`MemoryBroker::set_online`] simulates a server outage: going offline drops
//! every open connection (their reserved jobs return to ready) and refuses new
//! ones until the broker is back online.
//!
//! Time-to-run is accepted but not enforced; a reserved job stays reserved
//! until its connection deletes, buries or disconnects.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};
use tubewarden_core::{Result, WardenError};

use crate::transport::{Job, JobId, Transport, TransportStats};

/// Tube selected by a fresh connection.
pub const DEFAULT_TUBE: &str = "default";

/// Upper bound on one wait inside `reserve` before the tubes are re-checked.
const RESERVE_POLL: Duration = Duration::from_millis(10);

/// Lifecycle state of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

#[derive(Debug)]
struct StoredJob {
    tube: String,
    priority: u32,
    body: Vec<u8>,
    state: JobState,
    ready_at: Instant,
    reserved_by: Option<u64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    last_job: JobId,
    last_connection: u64,
    offline: bool,
    connections: HashSet<u64>,
    jobs: BTreeMap<JobId, StoredJob>,
}

impl BrokerState {
    fn promote_delayed(&mut self, now: Instant) {
        for job in self.jobs.values_mut() {
            if job.state == JobState::Delayed && job.ready_at <= now {
                job.state = JobState::Ready;
            }
        }
    }

    fn release(&mut self, connection: u64) {
        for job in self.jobs.values_mut() {
            if job.reserved_by == Some(connection) {
                job.state = JobState::Ready;
                job.reserved_by = None;
            }
        }
    }

    fn count(&self, tube: Option<&str>, state: JobState) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == state && tube.is_none_or(|t| job.tube == t))
            .count()
    }
}

/// Shared in-memory queue server.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    arrivals: Arc<Notify>,
}

impl MemoryBroker {
    /// Create an empty, online broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new (disconnected) client for this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            connection: None,
            used: DEFAULT_TUBE.to_string(),
            watched: BTreeSet::new(),
            reserve_timeout: Duration::ZERO,
        }
    }

    /// Bring the server up or down. Going down drops every open connection.
    pub async fn set_online(&self, online: bool) {
        let mut state = self.state.lock().await;
        state.offline = !online;
        if !online {
            let dropped: Vec<u64> = state.connections.drain().collect();
            for connection in dropped {
                state.release(connection);
            }
        }
        debug!(online, "memory broker availability changed");
    }

    /// Bodies of the ready jobs in `tube`, in reservation order.
    pub async fn ready_bodies(&self, tube: &str) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.promote_delayed(Instant::now());
        let mut ready: Vec<(u32, JobId, Vec<u8>)> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.tube == tube && job.state == JobState::Ready)
            .map(|(id, job)| (job.priority, *id, job.body.clone()))
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, _, body)| body).collect()
    }

    /// Number of jobs in `tube` with the given state.
    pub async fn count(&self, tube: &str, state: JobState) -> usize {
        let mut guard = self.state.lock().await;
        guard.promote_delayed(Instant::now());
        guard.count(Some(tube), state)
    }

    /// Current state of a job, `None` once deleted.
    pub async fn job_state(&self, id: JobId) -> Option<JobState> {
        let mut state = self.state.lock().await;
        state.promote_delayed(Instant::now());
        state.jobs.get(&id).map(|job| job.state)
    }

    /// Operator action: move up to `bound` buried jobs of `tube` back to ready.
    pub async fn kick(&self, tube: &str, bound: usize) -> usize {
        let mut state = self.state.lock().await;
        let mut kicked = 0;
        for job in state.jobs.values_mut() {
            if kicked == bound {
                break;
            }
            if job.tube == tube && job.state == JobState::Buried {
                job.state = JobState::Ready;
                kicked += 1;
            }
        }
        if kicked > 0 {
            self.arrivals.notify_waiters();
        }
        kicked
    }
}

/// One client connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    connection: Option<u64>,
    used: String,
    watched: BTreeSet<String>,
    reserve_timeout: Duration,
}

impl MemoryTransport {
    /// How long `reserve` waits for a job before returning `None` (default: no wait).
    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    /// Tubes currently watched.
    pub fn watched(&self) -> impl Iterator<Item = &str> {
        self.watched.iter().map(String::as_str)
    }

    /// Lock the broker, failing unless this connection is still open.
    async fn session(&self, operation: &str) -> Result<(MutexGuard<'_, BrokerState>, u64)> {
        let state = self.broker.state.lock().await;
        match self.connection {
            Some(connection) if !state.offline && state.connections.contains(&connection) => {
                Ok((state, connection))
            }
            Some(_) => Err(WardenError::transport(operation, "connection lost")),
            None => Err(WardenError::transport(operation, "not connected")),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        if state.offline {
            return Err(WardenError::transport("connect", "connection refused"));
        }
        if let Some(old) = self.connection.take() {
            state.connections.remove(&old);
            state.release(old);
        }

        state.last_connection += 1;
        let connection = state.last_connection;
        state.connections.insert(connection);
        drop(state);

        self.connection = Some(connection);
        self.used = DEFAULT_TUBE.to_string();
        self.watched.clear();
        trace!(connection, "memory transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let mut state = self.broker.state.lock().await;
        state.connections.remove(&connection);
        state.release(connection);
        drop(state);

        self.broker.arrivals.notify_waiters();
        trace!(connection, "memory transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn use_channel(&mut self, tube: &str) -> Result<()> {
        drop(self.session("use").await?);
        self.used = tube.to_string();
        Ok(())
    }

    async fn watch(&mut self, tube: &str) -> Result<()> {
        drop(self.session("watch").await?);
        self.watched.insert(tube.to_string());
        Ok(())
    }

    async fn put(&mut self, priority: u32, delay: Duration, _ttr: Duration, body: &[u8]) -> Result<JobId> {
        let (mut state, _) = self.session("put").await?;
        state.last_job += 1;
        let id = state.last_job;

        let now = Instant::now();
        let state_of_job = if delay.is_zero() { JobState::Ready } else { JobState::Delayed };
        state.jobs.insert(
            id,
            StoredJob {
                tube: self.used.clone(),
                priority,
                body: body.to_vec(),
                state: state_of_job,
                ready_at: now + delay,
                reserved_by: None,
            },
        );
        drop(state);

        self.broker.arrivals.notify_waiters();
        Ok(id)
    }

    async fn reserve(&mut self) -> Result<Option<Job>> {
        let deadline = Instant::now() + self.reserve_timeout;
        loop {
            {
                let (mut state, connection) = self.session("reserve").await?;
                state.promote_delayed(Instant::now());

                let next = state
                    .jobs
                    .iter()
                    .filter(|(_, job)| job.state == JobState::Ready && self.watched.contains(&job.tube))
                    .min_by_key(|(id, job)| (job.priority, **id))
                    .map(|(id, _)| *id);

                if let Some(id) = next
                    && let Some(job) = state.jobs.get_mut(&id)
                {
                    job.state = JobState::Reserved;
                    job.reserved_by = Some(connection);
                    return Ok(Some(Job {
                        id,
                        body: job.body.clone(),
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(RESERVE_POLL);
            let _ = tokio::time::timeout(wait, self.broker.arrivals.notified()).await;
        }
    }

    async fn delete(&mut self, id: JobId) -> Result<()> {
        let (mut state, connection) = self.session("delete").await?;
        let deletable = state.jobs.get(&id).is_some_and(|job| {
            job.reserved_by == Some(connection) || job.state == JobState::Buried
        });
        if !deletable {
            return Err(WardenError::transport("delete", format!("job {id} not found")));
        }
        state.jobs.remove(&id);
        Ok(())
    }

    async fn bury(&mut self, id: JobId) -> Result<()> {
        let (mut state, connection) = self.session("bury").await?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.reserved_by == Some(connection) => {
                job.state = JobState::Buried;
                job.reserved_by = None;
                Ok(())
            }
            _ => Err(WardenError::transport("bury", format!("job {id} not reserved"))),
        }
    }

    async fn stats(&mut self) -> Result<TransportStats> {
        let (mut state, _) = self.session("stats").await?;
        state.promote_delayed(Instant::now());
        Ok(TransportStats {
            ready: state.count(None, JobState::Ready),
            reserved: state.count(None, JobState::Reserved),
            delayed: state.count(None, JobState::Delayed),
            buried: state.count(None, JobState::Buried),
            total_jobs: state.last_job,
            current_connections: state.connections.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTR: Duration = Duration::from_secs(60);

    async fn connected(broker: &MemoryBroker, tube: &str) -> MemoryTransport {
        let mut transport = broker.transport();
        transport.connect().await.unwrap();
        transport.use_channel(tube).await.unwrap();
        transport.watch(tube).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_reserve_order_by_priority_then_id() {
        let broker = MemoryBroker::new();
        let mut client = connected(&broker, "goods.solr").await;
        client.put(20, Duration::ZERO, TTR, b"low").await.unwrap();
        client.put(11, Duration::ZERO, TTR, b"first").await.unwrap();
        client.put(11, Duration::ZERO, TTR, b"second").await.unwrap();

        let mut bodies = Vec::new();
        while let Some(job) = client.reserve().await.unwrap() {
            bodies.push(job.body_lossy().into_owned());
            client.delete(job.id).await.unwrap();
        }
        assert_eq!(bodies, vec!["first", "second", "low"]);
    }

    #[tokio::test]
    async fn test_only_watched_tubes_are_reserved() {
        let broker = MemoryBroker::new();
        let mut producer = connected(&broker, "goods.cache").await;
        producer.put(11, Duration::ZERO, TTR, b"x").await.unwrap();

        let mut consumer = connected(&broker, "goods.solr").await;
        assert_eq!(consumer.reserve().await.unwrap(), None);
        assert_eq!(broker.count("goods.cache", JobState::Ready).await, 1);
    }

    #[tokio::test]
    async fn test_ids_never_reused() {
        let broker = MemoryBroker::new();
        let mut client = connected(&broker, "t").await;
        let first = client.put(1, Duration::ZERO, TTR, b"a").await.unwrap();
        let job = client.reserve().await.unwrap().unwrap();
        client.delete(job.id).await.unwrap();
        let second = client.put(1, Duration::ZERO, TTR, b"b").await.unwrap();
        assert!(second > first);
        assert_eq!(broker.job_state(first).await, None);
    }

    #[tokio::test]
    async fn test_bury_and_kick() {
        let broker = MemoryBroker::new();
        let mut client = connected(&broker, "t").await;
        client.put(1, Duration::ZERO, TTR, b"poison").await.unwrap();
        let job = client.reserve().await.unwrap().unwrap();
        client.bury(job.id).await.unwrap();

        assert_eq!(client.reserve().await.unwrap(), None);
        assert_eq!(broker.job_state(job.id).await, Some(JobState::Buried));
        assert_eq!(broker.kick("t", 10).await, 1);
        assert_eq!(client.reserve().await.unwrap().map(|j| j.id), Some(job.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_becomes_ready() {
        let broker = MemoryBroker::new();
        let mut client = connected(&broker, "t").await;
        let id = client.put(1, Duration::from_secs(30), TTR, b"later").await.unwrap();
        assert_eq!(broker.job_state(id).await, Some(JobState::Delayed));
        assert_eq!(client.reserve().await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(client.reserve().await.unwrap().map(|j| j.id), Some(id));
    }

    #[tokio::test]
    async fn test_outage_drops_connections_and_releases_jobs() {
        let broker = MemoryBroker::new();
        let mut client = connected(&broker, "t").await;
        client.put(1, Duration::ZERO, TTR, b"a").await.unwrap();
        let job = client.reserve().await.unwrap().unwrap();

        broker.set_online(false).await;
        assert!(client.reserve().await.unwrap_err().is_transport_error());
        assert!(client.connect().await.is_err());
        assert_eq!(broker.job_state(job.id).await, Some(JobState::Ready));

        broker.set_online(true).await;
        let mut client = connected(&broker, "t").await;
        assert_eq!(client.reserve().await.unwrap().map(|j| j.id), Some(job.id));
        assert_eq!(client.stats().await.unwrap().current_connections, 1);
    }

    #[tokio::test]
    async fn test_disconnected_operations_fail() {
        let broker = MemoryBroker::new();
        let mut client = broker.transport();
        assert!(!client.is_connected());
        assert!(client.put(1, Duration::ZERO, TTR, b"a").await.is_err());
        assert!(client.stats().await.is_err());
        client.disconnect().await.unwrap();
    }
}
