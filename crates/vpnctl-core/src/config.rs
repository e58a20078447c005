//! Controller Configuration
//!
//! Provider identity and the timing constants of the session controller.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Provider bundle identifier of the packet tunnel
    pub provider_id: String,
    /// Profile name shown by the OS
    pub profile_label: String,
    /// Stats/elapsed-time poll cadence (ms)
    pub poll_interval_ms: u64,
    /// Bound on a single stats request (ms)
    pub sample_timeout_ms: u64,
    /// Pause between stop and start on a full restart (ms)
    pub restart_grace_ms: u64,
    /// Longest wait for the platform to report the tunnel down (ms)
    pub teardown_timeout_ms: u64,
    /// Longest wait behind another lifecycle operation before `Busy` (ms)
    pub lifecycle_wait_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provider_id: "com.vpnctl.PacketTunnel".to_string(),
            profile_label: "vpnctl".to_string(),
            poll_interval_ms: 1000,
            sample_timeout_ms: 500,
            restart_grace_ms: 1000,
            teardown_timeout_ms: 10_000,
            lifecycle_wait_ms: 30_000,
        }
    }
}

impl ControllerConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_id.trim().is_empty() {
            return Err(ConfigError::BlankProvider);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.sample_timeout_ms >= self.poll_interval_ms {
            return Err(ConfigError::SampleTimeoutTooLong);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn lifecycle_wait(&self) -> Duration {
        Duration::from_millis(self.lifecycle_wait_ms)
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(String),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Provider identifier must not be blank")]
    BlankProvider,

    #[error("Poll interval must be non-zero")]
    ZeroPollInterval,

    #[error("Sample timeout must be shorter than the poll interval")]
    SampleTimeoutTooLong,
}
