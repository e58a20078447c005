//! Platform VPN subsystem contract
//!
//! The platform persists tunnel profiles, opens and closes the OS-level
//! tunnel, and pushes lifecycle status. The controller only ever reaches it
//! through [`VpnPlatform`] and [`TunnelConnection`].

use crate::state::SessionState;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Identity of a persisted tunnel profile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileId(String);

impl ProfileId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The platform-registered configuration object for this VPN provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelProfile {
    /// Store identity
    pub id: ProfileId,
    /// Provider bundle identifier
    pub provider_id: String,
    /// Display name shown by the OS
    pub label: String,
    /// Whether the OS may start this tunnel
    pub enabled: bool,
}

impl TunnelProfile {
    /// Create an unsaved, disabled profile
    pub fn new(provider_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: ProfileId::generate(),
            provider_id: provider_id.into(),
            label: label.into(),
            enabled: false,
        }
    }
}

/// Options handed to the platform when starting the tunnel.
///
/// Opaque to the controller; the packet tunnel reads them on its side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Engine configuration
    pub config: String,
    /// Lift the tunnel process memory limit
    pub disable_memory_limit: bool,
}

impl TunnelOptions {
    /// Key/value form as the platform transports it
    pub fn entries(&self) -> [(&'static str, &str); 2] {
        [
            ("Config", self.config.as_str()),
            (
                "DisableMemoryLimit",
                if self.disable_memory_limit { "YES" } else { "NO" },
            ),
        ]
    }
}

/// Platform errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("Preference store unreachable: {0}")]
    Unreachable(String),

    #[error("Platform rejected request: {0}")]
    Rejected(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Profile not found: {0}")]
    NotFound(ProfileId),

    #[error("Tunnel not connected")]
    NotConnected,
}

/// Live reference to a tunnel session
#[async_trait]
pub trait TunnelConnection: Send + Sync {
    /// Ask the platform to open the tunnel
    async fn start(&self, options: &TunnelOptions) -> Result<(), PlatformError>;

    /// Ask the platform to close the tunnel
    async fn stop(&self) -> Result<(), PlatformError>;

    /// Send a control message to the running tunnel and wait for its reply
    async fn send_message(&self, message: &[u8]) -> Result<Vec<u8>, PlatformError>;
}

/// Profile store plus connection factory plus status signal
#[async_trait]
pub trait VpnPlatform: Send + Sync {
    /// List every profile this app owns
    async fn load_all(&self) -> Result<Vec<TunnelProfile>, PlatformError>;

    /// Persist a profile (insert or update)
    async fn save(&self, profile: &TunnelProfile) -> Result<(), PlatformError>;

    /// Reload a profile from the store
    async fn load(&self, id: &ProfileId) -> Result<TunnelProfile, PlatformError>;

    /// Remove a profile from the store
    async fn remove(&self, id: &ProfileId) -> Result<(), PlatformError>;

    /// Connection handle for a persisted profile
    fn connection(&self, profile: &TunnelProfile) -> Result<Arc<dyn TunnelConnection>, PlatformError>;

    /// Subscribe to lifecycle status pushes
    fn subscribe(&self) -> watch::Receiver<SessionState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_profile_is_disabled_and_unique() {
        let a = TunnelProfile::new("com.example.tunnel", "Example");
        let b = TunnelProfile::new("com.example.tunnel", "Example");

        assert!(!a.enabled);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_tunnel_option_entries() {
        let options = TunnelOptions {
            config: "{}".to_string(),
            disable_memory_limit: true,
        };

        assert_eq!(options.entries(), [("Config", "{}"), ("DisableMemoryLimit", "YES")]);
    }
}
