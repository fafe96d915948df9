//! Daemon configuration.
//!
//! Loaded from a JSON file with serde defaults for every field, then
//! overridden by CLI flags in the binary. Catalog locations and the model
//! file layout are derived from `config_dir` / `data_dir`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address for the API and proxy.
    #[serde(default = "default_address")]
    pub address: String,

    /// Directory holding `devices.yaml` and `models.yaml`.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Directory holding model files under `models/<owner>/<name>`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Inclusive port range leased to instance backends.
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// How long a starting instance may take to answer its health probe.
    #[serde(default = "default_health_deadline_secs")]
    pub health_deadline_secs: u64,

    /// Optional suffix appended to container names. Empty by default.
    #[serde(default)]
    pub server_name: String,

    /// Prometheus exporter port (0 to disable).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_address() -> String {
    "127.0.0.1:11581".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/xw")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/xw")
}

fn default_min_port() -> u16 {
    crate::ports::DEFAULT_MIN_PORT
}

fn default_max_port() -> u16 {
    crate::ports::DEFAULT_MAX_PORT
}

fn default_health_deadline_secs() -> u64 {
    300
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are total")
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn devices_catalog_path(&self) -> PathBuf {
        self.config_dir.join("devices.yaml")
    }

    pub fn models_catalog_path(&self) -> PathBuf {
        self.config_dir.join("models.yaml")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    fn server_file_path(&self) -> PathBuf {
        self.config_dir.join("server.json")
    }
}

/// Contents of `<config_dir>/server.json`, written on boot so clients can
/// discover the server address, removed on clean shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFile {
    pub address: String,
    pub pid: u32,
    pub start_time: u64,
    pub version: String,
}

impl ServerFile {
    pub fn current(address: &str) -> Self {
        Self {
            address: address.to_string(),
            pid: std::process::id(),
            start_time: crate::registry::epoch_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Write `server.json` for this process.
pub fn write_server_file(config: &Config) -> Result<()> {
    let path = config.server_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = ServerFile::current(&config.address);
    let data = serde_json::to_vec_pretty(&file)?;
    std::fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Wrote server file");
    Ok(())
}

/// Remove `server.json`. Missing files are fine; a crashed daemon leaves
/// one behind and the next boot overwrites it.
pub fn remove_server_file(config: &Config) {
    let path = config.server_file_path();
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::info!(path = %path.display(), "Removed server file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove server file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.address, "127.0.0.1:11581");
        assert_eq!(config.min_port, 10881);
        assert_eq!(config.max_port, 11881);
        assert!(config.server_name.is_empty());
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = serde_json::from_str(
            r#"{"address": "0.0.0.0:8080", "data_dir": "/tmp/xw-data"}"#,
        )
        .unwrap();
        assert_eq!(config.address, "0.0.0.0:8080");
        assert_eq!(config.models_dir(), PathBuf::from("/tmp/xw-data/models"));
        assert_eq!(config.health_deadline_secs, 300);
    }

    #[test]
    fn test_server_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            config_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };

        write_server_file(&config).unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("server.json")).unwrap();
        let file: ServerFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.address, config.address);
        assert_eq!(file.pid, std::process::id());

        remove_server_file(&config);
        assert!(!tmp.path().join("server.json").exists());
        // Second removal is a no-op.
        remove_server_file(&config);
    }
}
