//! Queue plumbing for tubewarden workers.
//!
//! Channel-groups fan out to subscriber channels named `group.subscriber`.
//! [`QueueProducer`] writes a full copy of each message to every subscriber
//! channel of a group; each worker process runs one [`QueueConsumer`] bound to
//! a single channel.
//!
//! # Example
//!
//! ```no_run
//! use tubewarden_config::WardenConfig;
//! use tubewarden_queue::{MemoryBroker, QueueConsumer, QueueProducer};
//!
//! # async fn demo() -> tubewarden_core::Result<()> {
//! let config = WardenConfig::from_yaml_str("subscribers: { goods: [solr, cache] }").unwrap();
//! let broker = MemoryBroker::new();
//!
//! let mut producer = QueueProducer::new(config.clone(), broker.transport());
//! producer.publish("goods", ["{\"sku\":1}"]).await?;
//!
//! let handler = |body: &[u8]| !body.is_empty();
//! let mut consumer = QueueConsumer::new(&config, "goods", "solr", broker.transport(), handler)?;
//! consumer.run().await
//! # }
//! ```

pub mod consumer;
pub mod event;
pub mod memory;
pub mod producer;
pub mod transport;

pub use consumer::{HandlerOutcome, IntoHandlerOutcome, MessageHandler, QueueConsumer, ReconnectPolicy, StepOutcome};
pub use event::{EventLog, EventOperation, EventSink, FileEventSink, QueueEvent, TracingEventSink};
pub use memory::{JobState, MemoryBroker, MemoryTransport};
pub use producer::{PRODUCT_DELAY, PRODUCT_PRIORITY, PRODUCT_TTR, QueueProducer};
pub use transport::{Job, JobId, Transport, TransportStats};
