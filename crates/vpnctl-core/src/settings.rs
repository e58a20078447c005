//! Settings mirror
//!
//! A shared key-value store with per-key atomic get/set and no multi-key
//! transactions. Callers that need two keys to agree re-read both right
//! before use.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const ACTIVE_CONFIG_PATH: &str = "activeConfigPath";
pub const ACTIVE_PROFILE_NAME: &str = "activeProfileName";
pub const CONFIG_OPTIONS: &str = "configOptions";
pub const SERVICE_MODE: &str = "serviceMode";
pub const CONNECT_TIME: &str = "connectTime";

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-key atomic key-value store
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError>;

    fn remove(&self, key: &str) -> Result<(), SettingsError>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// JSON file store, written through on every mutation
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: RwLock<HashMap<String, Value>>,
}

impl FileSettings {
    /// Open (or lazily create) the settings file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(entries = values.len(), "Loaded settings from {}", path.display());

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// `<data dir>/vpnctl/settings.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vpnctl")
            .join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// How the engine is run by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceMode {
    /// Full packet tunnel
    #[default]
    Vpn,
    /// Local proxy only
    Proxy,
    /// Local proxy registered as the system proxy
    SystemProxy,
}

/// Typed view of the opaque config options blob.
///
/// Unknown keys are ignored; a blank or malformed blob reads as defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConfigOptions {
    pub service_mode: ServiceMode,
    pub disable_memory_limit: bool,
}

impl ConfigOptions {
    pub fn parse(blob: &str) -> Self {
        if blob.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(blob).unwrap_or_else(|e| {
            warn!("Ignoring malformed config options: {}", e);
            Self::default()
        })
    }
}

/// Typed accessors over a shared [`SettingsStore`]
#[derive(Clone)]
pub struct SettingsMirror {
    store: Arc<dyn SettingsStore>,
}

impl SettingsMirror {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Mirror over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySettings::new()))
    }

    fn string(&self, key: &str) -> String {
        match self.store.get(key) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        }
    }

    pub fn active_config_path(&self) -> String {
        self.string(ACTIVE_CONFIG_PATH)
    }

    pub fn set_active_config_path(&self, path: &str) -> Result<(), SettingsError> {
        self.store.set(ACTIVE_CONFIG_PATH, Value::from(path))
    }

    pub fn active_profile_name(&self) -> String {
        self.string(ACTIVE_PROFILE_NAME)
    }

    pub fn set_active_profile_name(&self, name: &str) -> Result<(), SettingsError> {
        self.store.set(ACTIVE_PROFILE_NAME, Value::from(name))
    }

    /// Raw options blob as last stored by the host
    pub fn config_options(&self) -> String {
        self.string(CONFIG_OPTIONS)
    }

    /// Store the options blob; a blank blob clears it
    pub fn set_config_options(&self, options: &str) -> Result<(), SettingsError> {
        if options.trim().is_empty() {
            return self.store.remove(CONFIG_OPTIONS);
        }
        self.store.set(CONFIG_OPTIONS, Value::from(options))
    }

    /// Parsed options blob
    pub fn options(&self) -> ConfigOptions {
        ConfigOptions::parse(&self.config_options())
    }

    /// Service mode the running tunnel was started with
    pub fn service_mode(&self) -> ServiceMode {
        self.store
            .get(SERVICE_MODE)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_service_mode(&self, mode: ServiceMode) -> Result<(), SettingsError> {
        self.store.set(SERVICE_MODE, serde_json::to_value(mode)?)
    }

    /// Check whether the pending options need a full service restart.
    ///
    /// Only compares. The new mode is stored by the start that applies it, so
    /// a restart that fails part way is still reported as pending next time.
    pub fn rebuild_service_mode(&self) -> bool {
        let requested = self.options().service_mode;
        if requested == self.service_mode() {
            return false;
        }
        debug!(?requested, "Service mode changed");
        true
    }

    /// Wall-clock time of the last successful connect
    pub fn connect_time(&self) -> Option<SystemTime> {
        let millis = self.store.get(CONNECT_TIME)?.as_u64()?;
        Some(UNIX_EPOCH + Duration::from_millis(millis))
    }

    pub fn set_connect_time(&self, time: SystemTime) -> Result<(), SettingsError> {
        let millis = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        self.store.set(CONNECT_TIME, Value::from(millis))
    }
}
