//! The durable watch loop.
//!
//! A [`QueueConsumer`] binds to exactly one channel (`group.subscriber`) and
//! repeats: reserve a job, hand the body to the [`MessageHandler`], delete the
//! job when the handler succeeded, bury it otherwise. Buried jobs are never
//! retried by this loop.
//!
//! A reserve that yields nothing counts as a miss. After
//! [`ReconnectPolicy::max_consecutive_misses`] misses in a row the consumer
//! waits [`ReconnectPolicy::backoff`], reconnects and re-watches its channel.
//! Transport failures never escape the loop.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};
use tubewarden_config::WardenConfig;
use tubewarden_core::{Channel, Result};

use crate::event::{EventLog, EventOperation, QueueEvent};
use crate::transport::{JobId, Transport};

/// Reconnect tuning for [`QueueConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive empty reservations before reconnecting
    pub max_consecutive_misses: u32,
    /// Pause before reconnecting
    pub backoff: Duration,
    /// Reconnect immediately on a transport error instead of counting it as a miss
    pub reconnect_on_error: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_misses: 10,
            backoff: Duration::from_secs(5),
            reconnect_on_error: false,
        }
    }
}

/// What a handler decided about one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; delete the job
    Done,
    /// Could not process; bury the job
    Park,
}

/// Conversion from a handler's return value into a [`HandlerOutcome`].
pub trait IntoHandlerOutcome {
    fn into_outcome(self) -> HandlerOutcome;
}

impl IntoHandlerOutcome for HandlerOutcome {
    fn into_outcome(self) -> HandlerOutcome {
        self
    }
}

impl IntoHandlerOutcome for bool {
    fn into_outcome(self) -> HandlerOutcome {
        if self { HandlerOutcome::Done } else { HandlerOutcome::Park }
    }
}

impl<E: std::fmt::Display> IntoHandlerOutcome for std::result::Result<bool, E> {
    fn into_outcome(self) -> HandlerOutcome {
        match self {
            Ok(done) => done.into_outcome(),
            Err(e) => {
                warn!(error = %e, "message handler failed");
                HandlerOutcome::Park
            }
        }
    }
}

/// Business logic applied to each message body.
///
/// Implemented for any `FnMut(&[u8])` closure returning `bool`,
/// `Result<bool, E>` or [`HandlerOutcome`].
pub trait MessageHandler: Send {
    fn handle(&mut self, body: &[u8]) -> HandlerOutcome;
}

impl<F, T> MessageHandler for F
where
    F: FnMut(&[u8]) -> T + Send,
    T: IntoHandlerOutcome,
{
    fn handle(&mut self, body: &[u8]) -> HandlerOutcome {
        self(body).into_outcome()
    }
}

/// Result of one [`QueueConsumer::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Handler succeeded and the job was deleted
    Processed(JobId),
    /// Handler failed and the job was buried
    Parked(JobId),
    /// Deleting or burying the job failed
    AckFailed(JobId),
    /// Nothing was reserved
    Missed { consecutive: u32 },
    /// The miss threshold was reached and the connection was re-established
    Reconnected,
    /// The miss threshold was reached but reconnecting failed
    ReconnectFailed,
}

/// Consumes one channel until stopped.
pub struct QueueConsumer<T: Transport, H: MessageHandler> {
    channel: Channel,
    transport: T,
    handler: H,
    policy: ReconnectPolicy,
    events: EventLog,
    misses: u32,
}

impl<T: Transport, H: MessageHandler> std::fmt::Debug for QueueConsumer<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("channel", &self.channel)
            .field("policy", &self.policy)
            .field("misses", &self.misses)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, H: MessageHandler> QueueConsumer<T, H> {
    /// Create a consumer for `group` / `subscriber`.
    ///
    /// Fails with [`WardenError::UnknownChannel`](tubewarden_core::WardenError::UnknownChannel)
    /// unless the pair is in the subscriber map.
    pub fn new(config: &WardenConfig, group: &str, subscriber: &str, transport: T, handler: H) -> Result<Self> {
        let channel = config.channel(group, subscriber)?;
        Ok(Self {
            channel,
            transport,
            handler,
            policy: ReconnectPolicy::default(),
            events: EventLog::from_config(&config.event_log),
            misses: 0,
        })
    }

    /// Override the reconnect policy.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the event log.
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// The bound channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Current run of empty reservations.
    pub fn consecutive_misses(&self) -> u32 {
        self.misses
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open a fresh connection and watch the channel.
    pub async fn connect(&mut self) -> Result<()> {
        let _ = self.transport.disconnect().await;
        self.transport.connect().await?;
        self.transport.watch(&self.channel.tube()).await?;
        debug!(channel = %self.channel, "consumer connected");
        Ok(())
    }

    /// One reserve iteration.
    pub async fn step(&mut self) -> StepOutcome {
        let job = match self.transport.reserve().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.emit(EventOperation::Idle, "no job before reserve timeout".to_string())
                    .await;
                return self.miss().await;
            }
            Err(e) => {
                self.emit(EventOperation::Error, e.to_string()).await;
                if self.policy.reconnect_on_error {
                    return self.reconnect().await;
                }
                return self.miss().await;
            }
        };
        self.misses = 0;

        let payload = job.body_lossy().into_owned();
        match self.handler.handle(&job.body) {
            HandlerOutcome::Done => match self.transport.delete(job.id).await {
                Ok(()) => {
                    self.emit(EventOperation::Consume, payload).await;
                    StepOutcome::Processed(job.id)
                }
                Err(e) => {
                    self.emit(EventOperation::Error, format!("delete {}: {e}", job.id)).await;
                    StepOutcome::AckFailed(job.id)
                }
            },
            HandlerOutcome::Park => match self.transport.bury(job.id).await {
                Ok(()) => {
                    self.emit(EventOperation::Park, payload).await;
                    StepOutcome::Parked(job.id)
                }
                Err(e) => {
                    self.emit(EventOperation::Error, format!("bury {}: {e}", job.id)).await;
                    StepOutcome::AckFailed(job.id)
                }
            },
        }
    }

    /// Consume until `shutdown` resolves, then close the connection.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<()> {
        if let Err(e) = self.connect().await {
            warn!(channel = %self.channel, error = %e, "initial connect failed, will retry");
            self.emit(EventOperation::Error, e.to_string()).await;
        }
        info!(channel = %self.channel, "consumer watching");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = self.step() => {}
            }
        }

        info!(channel = %self.channel, "consumer stopping");
        self.transport.disconnect().await
    }

    /// Consume forever.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    async fn miss(&mut self) -> StepOutcome {
        self.misses += 1;
        if self.misses < self.policy.max_consecutive_misses {
            return StepOutcome::Missed {
                consecutive: self.misses,
            };
        }
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> StepOutcome {
        self.misses = 0;
        info!(channel = %self.channel, backoff = ?self.policy.backoff, "reconnecting consumer");
        tokio::time::sleep(self.policy.backoff).await;

        match self.connect().await {
            Ok(()) => {
                self.emit(EventOperation::Reconnect, String::new()).await;
                StepOutcome::Reconnected
            }
            Err(e) => {
                self.emit(EventOperation::Error, format!("reconnect: {e}")).await;
                StepOutcome::ReconnectFailed
            }
        }
    }

    async fn emit(&self, operation: EventOperation, payload: String) {
        self.events
            .emit(QueueEvent::new(operation, &self.channel, payload))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_return_values() {
        let mut yes = |_: &[u8]| true;
        let mut no = |_: &[u8]| false;
        let mut fails = |_: &[u8]| -> std::result::Result<bool, String> { Err("bad json".into()) };
        let mut parses = |body: &[u8]| -> std::result::Result<bool, String> { Ok(!body.is_empty()) };

        assert_eq!(yes.handle(b"x"), HandlerOutcome::Done);
        assert_eq!(no.handle(b"x"), HandlerOutcome::Park);
        assert_eq!(fails.handle(b"x"), HandlerOutcome::Park);
        assert_eq!(parses.handle(b"x"), HandlerOutcome::Done);
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_consecutive_misses, 10);
        assert_eq!(policy.backoff, Duration::from_secs(5));
        assert!(!policy.reconnect_on_error);
    }
}
