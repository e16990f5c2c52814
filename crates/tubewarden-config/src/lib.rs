//! Configuration management for tubewarden.
//!
//! The configuration is a single YAML document describing the subscriber map,
//! the worker scripts the supervisor keeps alive, the queue endpoint and the
//! daemon's timing knobs. It is re-read from disk on every supervisor cycle,
//! so edits take effect within one polling interval.
//!
//! ```yaml
//! subscribers:
//!   goods: [solr, cache]
//! watch_scripts:
//!   - /opt/workers/solr_watch.php goods
//! interpreter: /usr/bin/php
//! beanstalkd:
//!   host: 127.0.0.1
//!   port: 11300
//! ```

pub mod config;
pub mod loader;

pub use config::{DaemonConfig, EventLogConfig, TransportConfig, WardenConfig};
pub use loader::{ConfigLoader, ScriptSource, default_config_path};
