use std::fs;

use tempfile::TempDir;

use alder_core::config::{Config, ConfigError, DEFAULT_MAX_POLL_INTERVAL_MS};

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("alder.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_from_file_merges_partial_config_over_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[storage]
data_dir = "/var/lib/alder"

[sync]
base_poll_interval_ms = 250

[repository]
location = "models"
extensions = [".model.json"]
"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.storage.data_dir, "/var/lib/alder");
    assert_eq!(config.sync.base_poll_interval_ms, 250);
    assert_eq!(config.sync.max_poll_interval_ms, DEFAULT_MAX_POLL_INTERVAL_MS);
    assert_eq!(config.repository.location, "models");
}

#[test]
fn test_from_file_rejects_unparseable_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[storage\ndata_dir = ");

    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_from_file_rejects_inverted_poll_intervals() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[sync]
base_poll_interval_ms = 60000
max_poll_interval_ms = 1000
"#,
    );

    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_from_file_reports_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = Config::from_file(dir.path().join("nope.toml"));
    assert!(matches!(result, Err(ConfigError::ReadError(_))));
}

#[test]
fn test_generated_default_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &Config::default_config_string());

    let config = Config::from_file(&path).unwrap();
    let defaults = Config::default();
    assert_eq!(config.storage.data_dir, defaults.storage.data_dir);
    assert_eq!(
        config.sync.base_poll_interval_ms,
        defaults.sync.base_poll_interval_ms
    );
    assert_eq!(config.repository.kind, defaults.repository.kind);
    assert_eq!(config.repository.extensions, defaults.repository.extensions);
}
