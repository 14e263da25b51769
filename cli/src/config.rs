// Configuration management for the blemsg CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blemsg/config.json
// - Linux: ~/.config/blemsg/config.json
// - Windows: %APPDATA%\blemsg\config.json

use anyhow::{Context, Result};
use blemsg_core::{parse_service_uuid, MessagingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine settings shared by both roles
    pub messaging: MessagingConfig,

    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,

    /// Loopback demo settings
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Message the central sends
    pub message: String,

    /// Reply the peripheral sends back
    pub reply: String,

    /// Chunks accepted before a simulated full queue; 0 disables
    pub write_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            messaging: MessagingConfig::default(),
            log_level: "warn".to_string(),
            demo: DemoConfig::default(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            message: "hello world, this exceeds one chunk".to_string(),
            reply: "hello back from the peripheral".to_string(),
            write_window: 0,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blemsg");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .messaging
                .validate()
                .context("Invalid messaging configuration")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The caller decides when to persist.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "service_uuid" => {
                updated.messaging.service_uuid =
                    parse_service_uuid(value).context("Invalid service UUID")?;
            }
            "characteristic_uuid" => {
                updated.messaging.characteristic_uuid =
                    parse_service_uuid(value).context("Invalid characteristic UUID")?;
            }
            "max_chunk_bytes" => {
                updated.messaging.max_chunk_bytes = value.parse().context("Invalid number")?;
            }
            "scan_timeout_secs" => {
                updated.messaging.default_scan_timeout_secs =
                    value.parse().context("Invalid number of seconds")?;
            }
            "command_buffer" => {
                updated.messaging.command_buffer = value.parse().context("Invalid number")?;
            }
            "log_level" => {
                tracing_subscriber::EnvFilter::try_new(value).context("Invalid log filter")?;
                updated.log_level = value.to_string();
            }
            "demo_message" => updated.demo.message = value.to_string(),
            "demo_reply" => updated.demo.reply = value.to_string(),
            "demo_write_window" => {
                updated.demo.write_window = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated
            .messaging
            .validate()
            .context("Invalid messaging configuration")?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "service_uuid".to_string(),
                self.messaging.service_uuid.to_string().to_uppercase(),
            ),
            (
                "characteristic_uuid".to_string(),
                self.messaging.characteristic_uuid.to_string().to_uppercase(),
            ),
            (
                "max_chunk_bytes".to_string(),
                self.messaging.max_chunk_bytes.to_string(),
            ),
            (
                "scan_timeout_secs".to_string(),
                self.messaging.default_scan_timeout_secs.to_string(),
            ),
            (
                "command_buffer".to_string(),
                self.messaging.command_buffer.to_string(),
            ),
            ("log_level".to_string(), self.log_level.clone()),
            ("demo_message".to_string(), self.demo.message.clone()),
            ("demo_reply".to_string(), self.demo.reply.clone()),
            (
                "demo_write_window".to_string(),
                self.demo.write_window.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.messaging.max_chunk_bytes, 20);
        assert_eq!(config.demo.write_window, 0);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_set_persist_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("service_uuid", "180D").unwrap();
        config.set("scan_timeout_secs", "0").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(
            reloaded.get("service_uuid").unwrap(),
            "0000180D-0000-1000-8000-00805F9B34FB"
        );
        assert_eq!(reloaded.get("scan_timeout_secs").unwrap(), "0");
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("max_chunk_bytes", "0").is_err());
        assert!(config.set("max_chunk_bytes", "lots").is_err());
        assert!(config.set("service_uuid", "xyz").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        // Failed sets leave the config untouched
        assert_eq!(config.messaging.max_chunk_bytes, 20);
    }

    #[test]
    fn test_get_unknown_key() {
        assert!(Config::default().get("bootstrap_nodes").is_none());
    }
}
