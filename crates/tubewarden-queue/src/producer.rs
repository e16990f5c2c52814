//! Fan-out publishing.
//!
//! [`QueueProducer::publish`] copies every message to every subscriber channel
//! of a channel-group. [`QueueProducer::publish_to`] targets one channel.
//!
//! The connection is opened lazily and probed with `stats` before each batch;
//! a failed probe triggers a transparent reconnect.

use std::time::Duration;

use tracing::{debug, warn};
use tubewarden_config::WardenConfig;
use tubewarden_core::{Channel, Result};

use crate::event::{EventLog, EventOperation, QueueEvent};
use crate::transport::{JobId, Transport};

/// Priority of every produced job.
pub const PRODUCT_PRIORITY: u32 = 11;

/// Delay of jobs produced by [`QueueProducer::publish`].
pub const PRODUCT_DELAY: Duration = Duration::ZERO;

/// Time-to-run of every produced job.
pub const PRODUCT_TTR: Duration = Duration::from_secs(60);

/// Publishes messages to configured channels.
pub struct QueueProducer<T: Transport> {
    config: WardenConfig,
    transport: T,
    events: EventLog,
}

impl<T: Transport> std::fmt::Debug for QueueProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProducer")
            .field("groups", &self.config.subscribers.keys().collect::<Vec<_>>())
            .field("connected", &self.transport.is_connected())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> QueueProducer<T> {
    /// Create a producer. No connection is opened until the first publish.
    pub fn new(config: WardenConfig, transport: T) -> Self {
        let events = EventLog::from_config(&config.event_log);
        Self {
            config,
            transport,
            events,
        }
    }

    /// Replace the event log.
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Publish every non-empty message to every subscriber of `group`.
    ///
    /// Each subscriber channel receives the messages in the given order.
    /// Returns the number of jobs enqueued (messages × subscribers).
    pub async fn publish<I, B>(&mut self, group: &str, messages: I) -> Result<usize>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let subscribers = self.config.subscribers_of(group)?.to_vec();
        let bodies: Vec<Vec<u8>> = messages
            .into_iter()
            .filter(|m| !m.as_ref().is_empty())
            .map(|m| m.as_ref().to_vec())
            .collect();
        if bodies.is_empty() {
            debug!(group, "nothing to publish");
            return Ok(0);
        }

        self.ensure_connected().await?;

        let mut enqueued = 0;
        for subscriber in subscribers {
            let channel = Channel::new(group, subscriber);
            for body in &bodies {
                self.put(&channel, body, PRODUCT_DELAY).await?;
                enqueued += 1;
            }
        }

        self.release().await;
        Ok(enqueued)
    }

    /// Publish one message to `group.subscriber`, optionally delayed.
    ///
    /// The pair is not checked against the subscriber map.
    pub async fn publish_to(
        &mut self,
        group: &str,
        subscriber: &str,
        message: impl AsRef<[u8]>,
        delay: Duration,
    ) -> Result<JobId> {
        self.ensure_connected().await?;
        let id = self.put(&Channel::new(group, subscriber), message.as_ref(), delay).await?;
        self.release().await;
        Ok(id)
    }

    async fn put(&mut self, channel: &Channel, body: &[u8], delay: Duration) -> Result<JobId> {
        let tube = channel.tube();
        let result = match self.transport.use_channel(&tube).await {
            Ok(()) => self.transport.put(PRODUCT_PRIORITY, delay, PRODUCT_TTR, body).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(id) => {
                let payload = String::from_utf8_lossy(body).into_owned();
                self.events
                    .emit(QueueEvent::new(EventOperation::Product, channel, payload))
                    .await;
                Ok(id)
            }
            Err(e) => {
                self.events
                    .emit(QueueEvent::new(EventOperation::Error, channel, e.to_string()))
                    .await;
                // Force a fresh connection on the next call.
                let _ = self.transport.disconnect().await;
                Err(e)
            }
        }
    }

    /// Open the connection, or verify the open one with a status probe.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.transport.is_connected() {
            match self.transport.stats().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "producer health check failed, reconnecting");
                    let _ = self.transport.disconnect().await;
                }
            }
        }
        self.transport.connect().await
    }

    /// Close the connection unless it is configured to persist.
    async fn release(&mut self) {
        if !self.config.beanstalkd.persistent {
            let _ = self.transport.disconnect().await;
        }
    }
}
