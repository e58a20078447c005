//! Proxy engine contracts
//!
//! Two seams into the proxy engine: the config engine (parse/build, pure with
//! respect to controller state) and the command control channel (an
//! out-of-band connection to the running engine).

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Config parse failed: {0}")]
    Parse(String),

    #[error("Config build failed: {0}")]
    Build(String),

    #[error("Command channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Reload rejected: {0}")]
    Reload(String),

    #[error("Outbound selection failed: {0}")]
    Select(String),

    #[error("URL test failed: {0}")]
    UrlTest(String),
}

/// Configuration parser/builder
#[async_trait]
pub trait ConfigEngine: Send + Sync {
    /// Parse the raw profile at `temp_path` and write the normalized config to `path`.
    ///
    /// Returns a message for the host (empty on a clean parse).
    async fn parse_config(&self, path: &str, temp_path: &str, debug: bool) -> Result<String, EngineError>;

    /// Build the runnable config from the stored profile and the options blob
    async fn build_config(&self, path: &str, options: &str) -> Result<String, EngineError>;
}

/// Connection to the running engine's control surface
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn reload_service(&self) -> Result<(), EngineError>;

    async fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> Result<(), EngineError>;

    async fn url_test(&self, group_tag: &str) -> Result<(), EngineError>;
}

/// Opens command channels; fails when the engine is not running
pub trait CommandChannelFactory: Send + Sync {
    fn open(&self) -> Result<Arc<dyn CommandChannel>, EngineError>;
}

/// Config engine over JSON files on disk.
///
/// `parse_config` accepts any JSON object and rewrites it pretty-printed;
/// `build_config` overlays the options object onto the stored config.
#[derive(Debug, Clone, Default)]
pub struct JsonConfigEngine;

impl JsonConfigEngine {
    pub fn new() -> Self {
        Self
    }

    fn parse_object(content: &str) -> Option<serde_json::Map<String, Value>> {
        match serde_json::from_str(content) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

#[async_trait]
impl ConfigEngine for JsonConfigEngine {
    async fn parse_config(&self, path: &str, temp_path: &str, debug: bool) -> Result<String, EngineError> {
        let content = tokio::fs::read_to_string(temp_path)
            .await
            .map_err(|e| EngineError::Parse(format!("{temp_path}: {e}")))?;

        let config = Self::parse_object(&content)
            .ok_or_else(|| EngineError::Parse(format!("{temp_path}: not a JSON object")))?;
        if debug {
            debug!(keys = config.len(), "parsed config from {}", temp_path);
        }

        let rendered = serde_json::to_string_pretty(&Value::Object(config))
            .map_err(|e| EngineError::Parse(e.to_string()))?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::Parse(format!("{}: {e}", parent.display())))?;
            }
        }
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| EngineError::Parse(format!("{path}: {e}")))?;

        info!("Config written to {}", path);
        Ok(String::new())
    }

    async fn build_config(&self, path: &str, options: &str) -> Result<String, EngineError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::Build(format!("{path}: {e}")))?;
        let mut config = Self::parse_object(&content)
            .ok_or_else(|| EngineError::Build(format!("{path}: not a JSON object")))?;

        if !options.trim().is_empty() {
            let overlay = Self::parse_object(options)
                .ok_or_else(|| EngineError::Build("options are not a JSON object".into()))?;
            config.extend(overlay);
        }

        serde_json::to_string(&Value::Object(config)).map_err(|e| EngineError::Build(e.to_string()))
    }
}
