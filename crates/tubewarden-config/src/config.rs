//! Configuration model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tubewarden_core::{Channel, Result, WardenError, WorkerScript};

/// Default supervisor polling interval (seconds).
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 5;

/// Default forced restart period for all workers (seconds).
pub const DEFAULT_RESTART_INTERVAL_SECS: u64 = 3600;

/// Default number of poll cycles in one alert window.
pub const DEFAULT_ALERT_INTERVAL_CYCLES: u32 = 120;

/// Default process-wide timezone.
pub const DEFAULT_TIMEZONE: &str = "Asia/Chongqing";

/// Default event log file size before truncation (20 MiB).
pub const DEFAULT_EVENT_LOG_MAX_BYTES: u64 = 20 * 1024 * 1024;

/// Complete tubewarden configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WardenConfig {
    /// Channel-group name to its ordered subscriber list
    pub subscribers: BTreeMap<String, Vec<String>>,

    /// Worker command lines kept alive by the supervisor
    pub watch_scripts: Vec<String>,

    /// Interpreter prepended to every script when launching (e.g. `/usr/bin/php`)
    pub interpreter: Option<PathBuf>,

    /// Queue server endpoint
    pub beanstalkd: TransportConfig,

    /// Recipients of the periodic script alert
    pub alert_recipients: Vec<String>,

    /// Supervisor timing
    pub daemon: DaemonConfig,

    /// Per-channel event log files
    pub event_log: EventLogConfig,
}

impl WardenConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// The configured worker scripts.
    ///
    /// Entries are trimmed, empty entries are dropped, and identical command
    /// lines collapse into one script. Order follows the configuration.
    pub fn scripts(&self) -> Vec<WorkerScript> {
        let mut seen = HashSet::new();
        self.watch_scripts
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(WorkerScript::new)
            .filter(|script| seen.insert(script.id.clone()))
            .collect()
    }

    /// Subscribers registered under `group`, in configuration order.
    pub fn subscribers_of(&self, group: &str) -> Result<&[String]> {
        self.subscribers
            .get(group)
            .map(Vec::as_slice)
            .ok_or_else(|| WardenError::unknown_channel(group, None))
    }

    /// Returns true if `subscriber` is registered under `group`.
    pub fn is_subscribed(&self, group: &str, subscriber: &str) -> bool {
        self.subscribers
            .get(group)
            .is_some_and(|subs| subs.iter().any(|s| s == subscriber))
    }

    /// Resolve the channel for `group` / `subscriber`, refusing unknown pairs.
    pub fn channel(&self, group: &str, subscriber: &str) -> Result<Channel> {
        if self.is_subscribed(group, subscriber) {
            Ok(Channel::new(group, subscriber))
        } else {
            Err(WardenError::unknown_channel(group, Some(subscriber)))
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.daemon.polling_interval_secs == 0 {
            return Err(WardenError::validation("daemon.polling_interval_secs must be > 0"));
        }

        // The alert fires when the cycle counter reaches 2, which needs a window of at least 3.
        if self.daemon.alert_interval_cycles < 3 {
            return Err(WardenError::validation(format!(
                "daemon.alert_interval_cycles must be >= 3, got {}",
                self.daemon.alert_interval_cycles
            )));
        }

        for (group, subscribers) in &self.subscribers {
            if group.is_empty() || group.contains('.') {
                return Err(WardenError::validation(format!(
                    "channel-group name '{group}' must be non-empty and must not contain '.'"
                )));
            }
            if subscribers.is_empty() {
                return Err(WardenError::validation(format!(
                    "channel-group '{group}' has no subscribers"
                )));
            }
            let mut seen = HashSet::new();
            for subscriber in subscribers {
                if subscriber.is_empty() || subscriber.contains('.') {
                    return Err(WardenError::validation(format!(
                        "subscriber '{subscriber}' in '{group}' must be non-empty and must not contain '.'"
                    )));
                }
                if !seen.insert(subscriber) {
                    return Err(WardenError::validation(format!(
                        "subscriber '{subscriber}' listed twice in '{group}'"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Queue server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Connect timeout in seconds
    pub timeout_secs: u64,

    /// Keep a persistent connection (producers); consumers always open their own
    pub persistent: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11300,
            timeout_secs: 3,
            persistent: true,
        }
    }
}

impl TransportConfig {
    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Supervisor timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between poll cycles
    pub polling_interval_secs: u64,

    /// Seconds between forced restarts of every worker
    pub restart_interval_secs: u64,

    /// Poll cycles per alert window
    pub alert_interval_cycles: u32,

    /// IANA timezone applied to the supervisor process
    pub timezone: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            restart_interval_secs: DEFAULT_RESTART_INTERVAL_SECS,
            alert_interval_cycles: DEFAULT_ALERT_INTERVAL_CYCLES,
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

impl DaemonConfig {
    /// Polling interval as a duration.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// Forced restart period as a duration.
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }
}

/// Event log file configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventLogConfig {
    /// Directory for `<group>.<subscriber>.log` files; `None` disables file output
    pub dir: Option<PathBuf>,

    /// Size after which a channel log file is truncated before the next write
    pub max_file_bytes: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_file_bytes: DEFAULT_EVENT_LOG_MAX_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
subscribers:
  goods: [solr, cache]
  orders: [billing]
watch_scripts:
  - /opt/workers/solr_watch.php goods
  - ""
  - "  /opt/workers/solr_watch.php goods  "
  - /opt/workers/cache_watch.php goods
interpreter: /usr/bin/php
beanstalkd:
  host: 192.168.2.231
  port: 11300
alert_recipients: [ops@example.com]
daemon:
  polling_interval_secs: 2
"#;

    #[test]
    fn test_parse_sample() {
        let config = WardenConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.subscribers["goods"], vec!["solr", "cache"]);
        assert_eq!(config.beanstalkd.address(), "192.168.2.231:11300");
        assert_eq!(config.beanstalkd.timeout_secs, 3);
        assert_eq!(config.daemon.polling_interval_secs, 2);
        assert_eq!(config.daemon.restart_interval_secs, DEFAULT_RESTART_INTERVAL_SECS);
        assert_eq!(config.interpreter, Some(PathBuf::from("/usr/bin/php")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scripts_skip_empty_and_dedupe() {
        let config = WardenConfig::from_yaml_str(SAMPLE).unwrap();
        let scripts = config.scripts();
        let commands: Vec<_> = scripts.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(
            commands,
            vec!["/opt/workers/solr_watch.php goods", "/opt/workers/cache_watch.php goods"]
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = WardenConfig::from_yaml_str("{}").unwrap();
        assert!(config.subscribers.is_empty());
        assert_eq!(config.daemon, DaemonConfig::default());
        assert_eq!(config.event_log.max_file_bytes, DEFAULT_EVENT_LOG_MAX_BYTES);
    }

    #[test]
    fn test_subscriber_lookup() {
        let config = WardenConfig::from_yaml_str(SAMPLE).unwrap();
        assert!(config.is_subscribed("goods", "cache"));
        assert!(!config.is_subscribed("goods", "billing"));
        assert!(!config.is_subscribed("missing", "solr"));
        assert_eq!(config.channel("orders", "billing").unwrap().tube(), "orders.billing");
        assert!(config.channel("orders", "solr").unwrap_err().is_config_error());
        assert!(config.subscribers_of("missing").is_err());
    }

    #[test]
    fn test_validate_rejects_small_alert_window() {
        let mut config = WardenConfig::default();
        config.daemon.alert_interval_cycles = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_subscribers() {
        let mut config = WardenConfig::default();
        config.subscribers.insert("goods".into(), vec![]);
        assert!(config.validate().is_err());

        config.subscribers.insert("goods".into(), vec!["solr".into(), "solr".into()]);
        assert!(config.validate().is_err());

        config.subscribers.insert("goods".into(), vec!["so.lr".into()]);
        assert!(config.validate().is_err());
    }
}
