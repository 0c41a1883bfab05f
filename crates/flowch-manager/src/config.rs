//! Flow channel service configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration of the flow channel service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowchConfig {
    /// Chain interaction settings.
    #[serde(default)]
    pub chain: ChainConfig,

    /// Automatic settlement settings.
    #[serde(default)]
    pub settler: SettlerConfig,

    /// Channel store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Confirmations awaited for funding messages and voucher submissions.
    #[serde(default = "default_message_confidence")]
    pub message_confidence: u64,
    /// Deadline for a single receipt wait, in seconds. Unset waits until cancelled.
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlerConfig {
    /// Whether inbound channels are redeemed automatically on settlement.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Confirmations required before a Settle message is acted upon.
    #[serde(default = "default_settler_confidence")]
    pub confidence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage backend (memory, rocksdb).
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory of the RocksDB database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_message_confidence() -> u64 {
    5
}
fn default_settler_confidence() -> u64 {
    default_message_confidence() + 1
}
fn default_true() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/flowch")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            message_confidence: default_message_confidence(),
            wait_timeout_secs: None,
        }
    }
}

impl Default for SettlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence: default_settler_confidence(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ChainConfig {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

impl FlowchConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: FlowchConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FlowchConfig::default();
        assert_eq!(config.chain.message_confidence, 5);
        assert_eq!(config.settler.confidence, 6);
        assert!(config.settler.enabled);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.chain.wait_timeout().is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_from_toml_partial() {
        let toml_str = r#"
[chain]
wait_timeout_secs = 30

[store]
backend = "rocksdb"
data_dir = "/var/lib/flowch"
"#;
        let config: FlowchConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.chain.wait_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.store.backend, StoreBackend::Rocksdb);
        assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/flowch"));
        // unspecified sections keep their defaults
        assert_eq!(config.chain.message_confidence, 5);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let config = FlowchConfig::load(Path::new("/nonexistent/flowch.toml")).unwrap();
        assert_eq!(config.settler.confidence, 6);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = std::env::temp_dir().join(format!("flowch-config-{}", uuid::Uuid::now_v7()));
        let path = dir.join("flowch.toml");
        let mut config = FlowchConfig::default();
        config.settler.enabled = false;
        config.logging.format = "json".into();
        config.save(&path).unwrap();

        let loaded = FlowchConfig::load(&path).unwrap();
        assert!(!loaded.settler.enabled);
        assert_eq!(loaded.logging.format, "json");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let res: Result<FlowchConfig, _> = toml::from_str("[store]\nbackend = \"postgres\"\n");
        assert!(res.is_err());
    }
}
