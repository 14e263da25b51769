// Messaging configuration shared by both roles

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::ble::framing::DEFAULT_CHUNK_SIZE;
use crate::transport::ble::gatt::{ServiceIdentity, CHARACTERISTIC_UUID, SERVICE_UUID};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read or write config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Service UUID advertised / scanned for unless the caller names another
    pub service_uuid: Uuid,

    /// The single message characteristic inside the service
    pub characteristic_uuid: Uuid,

    /// Upper bound on chunk size before any transport-reported limit
    pub max_chunk_bytes: usize,

    /// Scan auto-stop in seconds; 0 scans until stopped
    pub default_scan_timeout_secs: u64,

    /// Depth of each role runtime's command channel
    pub command_buffer: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            max_chunk_bytes: DEFAULT_CHUNK_SIZE,
            default_scan_timeout_secs: 30,
            command_buffer: 64,
        }
    }
}

impl MessagingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_chunk_bytes must be at least 1".to_string(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid(
                "command_buffer must be at least 1".to_string(),
            ));
        }
        if self.service_uuid == self.characteristic_uuid {
            return Err(ConfigError::Invalid(
                "service and characteristic UUIDs must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.service_uuid, self.characteristic_uuid)
    }

    pub fn default_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.default_scan_timeout_secs)
    }

    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: MessagingConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
