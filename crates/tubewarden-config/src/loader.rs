//! Loading configuration from disk.

use std::path::{Path, PathBuf};

use tracing::debug;
use tubewarden_core::{Result, WardenError, WorkerScript, logging};

use crate::config::WardenConfig;

/// Config file path (`~/.tubewarden/config.yaml`).
pub fn default_config_path() -> Result<PathBuf> {
    Ok(logging::home_dir()?.join("config.yaml"))
}

/// Source of the configured worker scripts, consulted once per supervisor cycle.
pub trait ScriptSource {
    /// Current script list. Called fresh every cycle; implementations must not cache.
    fn load_scripts(&self) -> Result<Vec<WorkerScript>>;
}

/// Reads [`WardenConfig`] from a YAML file on every call.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// Create a loader for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the configuration file.
    pub fn load(&self) -> Result<WardenConfig> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WardenError::config_not_found_with_source(&self.path, e)
            } else {
                WardenError::io("reading config", &self.path, e)
            }
        })?;

        let config =
            WardenConfig::from_yaml_str(&content).map_err(|e| WardenError::ConfigInvalid {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        config.validate()?;

        debug!(path = %self.path.display(), scripts = config.watch_scripts.len(), "configuration loaded");
        Ok(config)
    }
}

impl ScriptSource for ConfigLoader {
    fn load_scripts(&self) -> Result<Vec<WorkerScript>> {
        Ok(self.load()?.scripts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_file() {
        let file = write_config("watch_scripts:\n  - worker-a\n  - worker-b\n");
        let loader = ConfigLoader::new(file.path());
        let scripts = loader.load_scripts().unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].command, "worker-a");
    }

    #[test]
    fn test_reload_sees_changes() {
        let file = write_config("watch_scripts: [worker-a]\n");
        let loader = ConfigLoader::new(file.path());
        assert_eq!(loader.load_scripts().unwrap().len(), 1);

        std::fs::write(file.path(), "watch_scripts: [worker-a, worker-b]\n").unwrap();
        assert_eq!(loader.load_scripts().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let loader = ConfigLoader::new("/nonexistent/tubewarden/config.yaml");
        let err = loader.load().unwrap_err();
        assert!(matches!(err, WardenError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_invalid_yaml() {
        let file = write_config("watch_scripts: [unterminated\n");
        let err = ConfigLoader::new(file.path()).load().unwrap_err();
        assert!(matches!(err, WardenError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_validation_applied_on_load() {
        let file = write_config("daemon:\n  polling_interval_secs: 0\n");
        let err = ConfigLoader::new(file.path()).load().unwrap_err();
        assert!(matches!(err, WardenError::ConfigValidation { .. }));
    }
}
