use anyhow::{Context, Result};
use pipeliner_core::paths::StatePaths;
use pipeliner_core::workflow::RetryBackoff;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub home: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_history_dir")]
    pub history_dir: String,

    #[serde(default = "default_schedules_file")]
    pub schedules_file: String,

    #[serde(default = "default_daemon_dir")]
    pub daemon_dir: String,
}

fn default_history_dir() -> String {
    "history".to_string()
}

fn default_schedules_file() -> String {
    "schedules.json".to_string()
}

fn default_daemon_dir() -> String {
    "daemon".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_dir: default_history_dir(),
            schedules_file: default_schedules_file(),
            daemon_dir: default_daemon_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    #[serde(default)]
    pub filter: Option<String>,

    /// JSON lines in the daemon log
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_retry_backoff_max_ms() -> u64 {
    10_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl CliConfig {
    /// Load `config.toml` from `home`, falling back to defaults when it is absent
    pub fn load(home: &Path) -> Result<Self> {
        std::fs::create_dir_all(home).context("Failed to create state directory")?;

        let config_path = StatePaths::new(home).config_file();
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self {
                home: PathBuf::new(),
                storage: StorageConfig::default(),
                logging: LoggingConfig::default(),
                execution: ExecutionConfig::default(),
            }
        };

        config.home = home.to_path_buf();
        Ok(config)
    }

    /// State locations with the configured overrides applied
    pub fn paths(&self) -> StatePaths {
        let mut paths = StatePaths::new(&self.home);
        paths.history_dir = self.home.join(&self.storage.history_dir);
        paths.schedules_file = self.home.join(&self.storage.schedules_file);
        paths.daemon_dir = self.home.join(&self.storage.daemon_dir);
        paths
    }

    pub fn retry_backoff(&self) -> RetryBackoff {
        RetryBackoff {
            base: Duration::from_millis(self.execution.retry_backoff_ms),
            max: Duration::from_millis(self.execution.retry_backoff_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = CliConfig::load(temp_dir.path()).unwrap();

        assert_eq!(config.paths(), StatePaths::new(temp_dir.path()));
        assert_eq!(config.retry_backoff(), RetryBackoff::default());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "[storage]\nhistory_dir = \"runs\"\n\n[execution]\nretry_backoff_ms = 50\n",
        )
        .unwrap();

        let config = CliConfig::load(temp_dir.path()).unwrap();
        let paths = config.paths();

        assert_eq!(paths.history_dir, temp_dir.path().join("runs"));
        assert_eq!(paths.schedules_file, temp_dir.path().join("schedules.json"));
        assert_eq!(config.retry_backoff().base, Duration::from_millis(50));
        assert_eq!(config.retry_backoff().max, Duration::from_millis(10_000));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("config.toml"), "[storage\n").unwrap();
        assert!(CliConfig::load(temp_dir.path()).is_err());
    }
}
