//! Configuration for stewardship-node

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stewardship::StewardshipConfig;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stewardship-node")
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the policy store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Address to bind the HTTP API to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Identity recorded on decisions made by the reference reviewer
    #[serde(default = "default_reviewer_id")]
    pub reviewer_id: String,

    /// Engine settings: threshold, review periods, appeal windows, cache, sweep
    #[serde(default)]
    pub stewardship: StewardshipConfig,
}

fn default_http_port() -> u16 {
    8095
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_reviewer_id() -> String {
    "rule-based-reviewer".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            bind_host: default_bind_host(),
            reviewer_id: default_reviewer_id(),
            stewardship: StewardshipConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Policy store directory
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("policies.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            http_port = 9100

            [stewardship.trigger]
            threshold = 12.5

            [stewardship.appeal]
            response_window_days = 14
            "#,
        )
        .unwrap();
        assert_eq!(config.http_port, 9100);
        assert_eq!(config.reviewer_id, "rule-based-reviewer");
        assert_eq!(config.stewardship.trigger.threshold, 12.5);
        assert_eq!(config.stewardship.appeal.response_window_days, 14);
        assert_eq!(config.stewardship.appeal.appeal_window_days, 7);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = NodeConfig::default();
        config.stewardship.sweep.interval_secs = 5;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.stewardship.sweep.interval_secs, 5);
        assert_eq!(loaded.http_port, config.http_port);
    }
}
