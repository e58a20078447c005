//! Profile Registrar
//!
//! Keeps exactly one tunnel profile registered with the platform preference
//! store. The profile is adopted if one already exists and created otherwise;
//! it is only removed by an explicit [`ProfileRegistrar::reset`].

use crate::platform::{PlatformError, TunnelProfile, VpnPlatform};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Registrar errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistrarError {
    #[error("Profile store error: {0}")]
    Store(#[source] PlatformError),

    #[error("Profile persist error: {0}")]
    Persist(#[source] PlatformError),

    #[error("Platform declined to enable the tunnel: {0}")]
    Permission(String),
}

impl RegistrarError {
    fn on_write(err: PlatformError) -> Self {
        match err {
            PlatformError::PermissionDenied(msg) => RegistrarError::Permission(msg),
            other => RegistrarError::Persist(other),
        }
    }
}

/// Owns the working tunnel profile
pub struct ProfileRegistrar {
    platform: Arc<dyn VpnPlatform>,
    provider_id: String,
    label: String,
    /// Working profile; the lock also serializes registration
    current: Mutex<Option<TunnelProfile>>,
}

impl ProfileRegistrar {
    pub fn new(platform: Arc<dyn VpnPlatform>, provider_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            platform,
            provider_id: provider_id.into(),
            label: label.into(),
            current: Mutex::new(None),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Return the working profile, registering one if the store has none
    pub async fn ensure_profile(&self) -> Result<TunnelProfile, RegistrarError> {
        let mut current = self.current.lock().await;
        if let Some(profile) = current.as_ref() {
            return Ok(profile.clone());
        }

        let profile = self.load_or_register().await?;
        *current = Some(profile.clone());
        Ok(profile)
    }

    async fn load_or_register(&self) -> Result<TunnelProfile, RegistrarError> {
        let existing = self.platform.load_all().await.map_err(RegistrarError::Store)?;
        if let Some(profile) = existing.into_iter().next() {
            debug!(profile = %profile.id, "Adopting existing tunnel profile");
            return Ok(profile);
        }

        let profile = TunnelProfile::new(&self.provider_id, &self.label);
        self.platform.save(&profile).await.map_err(RegistrarError::Persist)?;
        let profile = self.platform.load(&profile.id).await.map_err(RegistrarError::Store)?;

        info!(profile = %profile.id, "Registered tunnel profile '{}'", profile.label);
        Ok(profile)
    }

    /// Enable the working profile and persist it
    pub async fn enable_profile(&self) -> Result<TunnelProfile, RegistrarError> {
        let mut profile = self.ensure_profile().await?;
        profile.enabled = true;
        self.platform.save(&profile).await.map_err(RegistrarError::on_write)?;
        let profile = self.platform.load(&profile.id).await.map_err(RegistrarError::Store)?;

        *self.current.lock().await = Some(profile.clone());
        Ok(profile)
    }

    /// Working profile if already known, without touching the store.
    ///
    /// Returns `None` while a registration is in flight.
    pub fn cached(&self) -> Option<TunnelProfile> {
        self.current.try_lock().ok().and_then(|current| current.clone())
    }

    /// Remove every profile of this provider.
    ///
    /// The next [`ensure_profile`](Self::ensure_profile) registers a new one.
    /// Callers must make sure the tunnel is down first.
    pub async fn reset(&self) -> Result<usize, RegistrarError> {
        let mut current = self.current.lock().await;
        *current = None;

        let profiles = self.platform.load_all().await.map_err(RegistrarError::Store)?;
        let mut removed = 0;
        for profile in profiles.iter().filter(|p| p.provider_id == self.provider_id) {
            self.platform.remove(&profile.id).await.map_err(RegistrarError::Persist)?;
            removed += 1;
        }

        info!(removed, "Removed tunnel profiles");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedPlatform;

    fn registrar(platform: &Arc<SimulatedPlatform>) -> ProfileRegistrar {
        ProfileRegistrar::new(platform.clone(), "com.test.Tunnel", "Test")
    }

    #[tokio::test]
    async fn test_ensure_profile_is_singleton() {
        let platform = Arc::new(SimulatedPlatform::new());
        let registrar = registrar(&platform);

        let first = registrar.ensure_profile().await.unwrap();
        let second = registrar.ensure_profile().await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(platform.profiles().len(), 1);
        assert_eq!(platform.save_count(), 1);
    }

    #[tokio::test]
    async fn test_adopts_existing_profile() {
        let platform = Arc::new(SimulatedPlatform::new());
        let existing = registrar(&platform).ensure_profile().await.unwrap();

        // Fresh registrar, as after a relaunch
        let adopted = registrar(&platform).ensure_profile().await.unwrap();

        assert_eq!(adopted.id, existing.id);
        assert_eq!(platform.profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_store_unreachable() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_store_unreachable(true);

        let result = registrar(&platform).ensure_profile().await;
        assert!(matches!(result, Err(RegistrarError::Store(_))));
        assert!(platform.profiles().is_empty());
    }

    #[tokio::test]
    async fn test_enable_profile_permission_denied() {
        let platform = Arc::new(SimulatedPlatform::new());
        let registrar = registrar(&platform);
        registrar.ensure_profile().await.unwrap();
        platform.set_deny_permission(true);

        let result = registrar.enable_profile().await;
        assert!(matches!(result, Err(RegistrarError::Permission(_))));
    }

    #[tokio::test]
    async fn test_enable_profile_persists() {
        let platform = Arc::new(SimulatedPlatform::new());
        let registrar = registrar(&platform);

        let profile = registrar.enable_profile().await.unwrap();

        assert!(profile.enabled);
        assert!(platform.profiles()[0].enabled);
        assert_eq!(registrar.cached(), Some(profile));
    }

    #[tokio::test]
    async fn test_reset_reregisters() {
        let platform = Arc::new(SimulatedPlatform::new());
        let registrar = registrar(&platform);
        let before = registrar.ensure_profile().await.unwrap();

        assert_eq!(registrar.reset().await.unwrap(), 1);
        assert!(platform.profiles().is_empty());
        assert_eq!(registrar.cached(), None);

        let after = registrar.ensure_profile().await.unwrap();
        assert_ne!(before.id, after.id);
        assert_eq!(platform.profiles().len(), 1);
    }
}
