//! Configuration management for Alder.
//!
//! Configuration is loaded from multiple sources with the following priority:
//! 1. Environment variables (highest priority)
//! 2. Project-local `alder.toml` file
//! 3. User config `~/.config/alder/config.toml`
//! 4. Built-in defaults (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod defaults;

pub use defaults::*;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,

    /// Synchronisation configuration.
    pub sync: SyncConfig,

    /// Repository configuration.
    pub repository: RepositoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            repository: RepositoryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Searches for config in order:
    /// 1. `./alder.toml` (project local)
    /// 2. `~/.config/alder/config.toml` (user config)
    /// 3. Falls back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        // Try project-local config first
        if Path::new("alder.toml").exists() {
            return Self::from_file("alder.toml");
        }

        // Try user config
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("alder").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Use defaults
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(dir) = std::env::var("ALDER_DATA_DIR") {
            self.storage.data_dir = dir;
        }

        // Sync overrides
        if let Ok(ms) = std::env::var("ALDER_BASE_POLL_INTERVAL_MS") {
            if let Ok(n) = ms.parse() {
                self.sync.base_poll_interval_ms = n;
            }
        }
        if let Ok(ms) = std::env::var("ALDER_MAX_POLL_INTERVAL_MS") {
            if let Ok(n) = ms.parse() {
                self.sync.max_poll_interval_ms = n;
            }
        }
        if let Ok(ms) = std::env::var("ALDER_FETCH_TIMEOUT_MS") {
            if let Ok(n) = ms.parse() {
                self.sync.fetch_timeout_ms = n;
            }
        }

        // Repository overrides
        if let Ok(location) = std::env::var("ALDER_REPOSITORY_LOCATION") {
            self.repository.location = location;
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.base_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.base_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.sync.base_poll_interval_ms > self.sync.max_poll_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "sync.base_poll_interval_ms ({}) exceeds sync.max_poll_interval_ms ({})",
                self.sync.base_poll_interval_ms, self.sync.max_poll_interval_ms
            )));
        }
        if self.sync.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.fetch_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a default config file content as a string.
    pub fn default_config_string() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for alder data (default: ".alder").
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.to_string(),
        }
    }
}

impl StorageConfig {
    /// Get the full path to the imports scratch directory.
    pub fn imports_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DEFAULT_IMPORTS_DIR)
    }
}

/// Synchronisation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Polling interval while the graph is changing (milliseconds).
    pub base_poll_interval_ms: u64,

    /// Ceiling the interval doubles towards while nothing changes
    /// (milliseconds).
    pub max_poll_interval_ms: u64,

    /// Timeout for fetching one file from an adapter (milliseconds).
    pub fetch_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_poll_interval_ms: DEFAULT_BASE_POLL_INTERVAL_MS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    pub fn base_poll_interval(&self) -> Duration {
        Duration::from_millis(self.base_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Adapter kind: currently "local".
    pub kind: String,

    /// Location the adapter watches (directory path for "local").
    pub location: String,

    /// File name suffixes to track; empty tracks everything.
    pub extensions: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_REPOSITORY_KIND.to_string(),
            location: ".".to_string(),
            extensions: DEFAULT_MODEL_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.sync.base_poll_interval_ms,
            DEFAULT_BASE_POLL_INTERVAL_MS
        );
        assert_eq!(config.storage.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(config.repository.kind, DEFAULT_REPOSITORY_KIND);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_to_toml() {
        let toml_str = Config::default_config_string();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("[repository]"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[storage]
data_dir = ".custom-alder"

[sync]
base_poll_interval_ms = 250

[repository]
location = "models"
extensions = [".model.json", ".json"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.data_dir, ".custom-alder");
        assert_eq!(config.sync.base_poll_interval_ms, 250);
        assert_eq!(config.sync.max_poll_interval_ms, DEFAULT_MAX_POLL_INTERVAL_MS);
        assert_eq!(config.repository.location, "models");
        assert_eq!(config.repository.extensions.len(), 2);
    }

    #[test]
    fn test_validate_rejects_inverted_intervals() {
        let mut config = Config::default();
        config.sync.base_poll_interval_ms = 10_000;
        config.sync.max_poll_interval_ms = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_imports_path() {
        let config = Config::default();
        assert_eq!(
            config.storage.imports_path(),
            PathBuf::from(".alder").join("imports")
        );
    }
}
