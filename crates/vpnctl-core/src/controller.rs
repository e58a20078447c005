//! Session Controller
//!
//! Drives the tunnel through its lifecycle and republishes live stats.
//!
//! The lifecycle state is not ours: the platform pushes it and the controller
//! reacts. Every local decision reads the current value, acts, and lets the
//! next push confirm.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::new(ControllerConfig::default(), collaborators);
//! controller.setup().await?;
//! let _poller = controller.spawn();
//!
//! controller.connect(&config, false).await?;
//! let mut snapshots = controller.subscribe();
//! ```
//!
//! # Exclusion
//!
//! `connect`, `disconnect`, `reset` and `restart_or_reload` share one
//! exclusive section. A second operation queues behind the first for at most
//! `lifecycle_wait`, then fails with [`SessionError::Busy`]. The poll loop
//! never takes that section; it re-checks the state right before each stats
//! request instead, and drops a reply that lands after the connection it was
//! asked of has gone.

use crate::config::ControllerConfig;
use crate::detect::InterfaceProbe;
use crate::engine::{CommandChannelFactory, ConfigEngine, EngineError};
use crate::platform::{PlatformError, TunnelConnection, TunnelOptions, TunnelProfile, VpnPlatform};
use crate::registrar::{ProfileRegistrar, RegistrarError};
use crate::sampler::StatsSampler;
use crate::settings::{ConfigOptions, SettingsError, SettingsMirror};
use crate::state::{RestartDecision, SessionSnapshot, SessionState, StatsSample};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Session controller errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Profile(RegistrarError),

    #[error("Platform declined to enable the tunnel: {0}")]
    Permission(String),

    #[error("Tunnel start failed: {0}")]
    TunnelStart(#[source] PlatformError),

    #[error("Tunnel stop failed: {0}")]
    TunnelStop(String),

    #[error("Timed out waiting for the platform (tunnel {0})")]
    Timeout(SessionState),

    #[error("Reload failed: {0}")]
    Reload(#[source] EngineError),

    #[error("Config build failed: {0}")]
    Build(#[source] EngineError),

    #[error("Another lifecycle operation is in flight")]
    Busy,

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl From<RegistrarError> for SessionError {
    fn from(err: RegistrarError) -> Self {
        match err {
            RegistrarError::Permission(msg) => SessionError::Permission(msg),
            other => SessionError::Profile(other),
        }
    }
}

/// External collaborators of the controller
pub struct Collaborators {
    pub platform: Arc<dyn VpnPlatform>,
    pub engine: Arc<dyn ConfigEngine>,
    pub commands: Arc<dyn CommandChannelFactory>,
    pub settings: SettingsMirror,
    pub probe: Arc<dyn InterfaceProbe>,
}

struct Inner {
    config: ControllerConfig,
    platform: Arc<dyn VpnPlatform>,
    engine: Arc<dyn ConfigEngine>,
    commands: Arc<dyn CommandChannelFactory>,
    settings: SettingsMirror,
    probe: Arc<dyn InterfaceProbe>,
    registrar: ProfileRegistrar,
    sampler: StatsSampler,
    /// Platform status pushes
    status: watch::Receiver<SessionState>,
    /// Republished (state, stats, elapsed, any-VPN)
    snapshot: watch::Sender<SessionSnapshot>,
    /// Exclusive section for lifecycle operations
    lifecycle: Mutex<()>,
    /// Connection handle, held while connecting or connected
    handle: StdMutex<Option<Arc<dyn TunnelConnection>>>,
    /// Write-through cache of the persisted connect time
    connect_time: RwLock<Option<SystemTime>>,
    /// Bumped on every connect; a stats reply only counts for its own epoch
    epoch: AtomicU64,
}

/// Session controller (cheap to clone, all clones share state)
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a controller and subscribe to platform status
    pub fn new(config: ControllerConfig, parts: Collaborators) -> Self {
        let registrar = ProfileRegistrar::new(parts.platform.clone(), &config.provider_id, &config.profile_label);
        let sampler = StatsSampler::new(config.sample_timeout());
        let status = parts.platform.subscribe();
        let connect_time = parts.settings.connect_time();

        let initial = SessionSnapshot {
            state: *status.borrow(),
            ..SessionSnapshot::default()
        };
        let (snapshot, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                config,
                platform: parts.platform,
                engine: parts.engine,
                commands: parts.commands,
                settings: parts.settings,
                probe: parts.probe,
                registrar,
                sampler,
                status,
                snapshot,
                lifecycle: Mutex::new(()),
                handle: StdMutex::new(None),
                connect_time: RwLock::new(connect_time),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Current lifecycle state, as last pushed by the platform
    pub fn state(&self) -> SessionState {
        *self.inner.status.borrow()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.inner.snapshot.borrow()
    }

    /// Subscribe to snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &SettingsMirror {
        &self.inner.settings
    }

    pub fn config_engine(&self) -> Arc<dyn ConfigEngine> {
        self.inner.engine.clone()
    }

    pub fn commands(&self) -> Arc<dyn CommandChannelFactory> {
        self.inner.commands.clone()
    }

    /// Wall-clock time of the last successful connect
    pub fn connect_time(&self) -> Option<SystemTime> {
        *self.inner.connect_time.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the last successful connect (zero if never connected)
    pub fn elapsed(&self) -> Duration {
        self.connect_time()
            .and_then(|at| SystemTime::now().duration_since(at).ok())
            .unwrap_or_default()
    }

    /// Register (or adopt) the tunnel profile
    pub async fn setup(&self) -> Result<TunnelProfile, SessionError> {
        let profile = self.inner.registrar.ensure_profile().await?;
        debug!(
            provider = self.inner.registrar.provider_id(),
            profile = %profile.id,
            state = %self.state(),
            "Controller ready"
        );
        Ok(profile)
    }

    /// Start the tunnel with `config`.
    ///
    /// No-op unless the tunnel is disconnected. Completed steps are not
    /// rolled back on failure: the profile stays enabled if the start fails.
    pub async fn connect(&self, config: &str, disable_memory_limit: bool) -> Result<(), SessionError> {
        let _guard = self.lifecycle().await?;
        self.connect_locked(config.to_string(), disable_memory_limit).await
    }

    /// Build the active profile's config from settings and connect
    pub async fn start_active_profile(&self) -> Result<(), SessionError> {
        let _guard = self.lifecycle().await?;
        let state = self.state();
        if state != SessionState::Disconnected {
            info!(%state, "Start ignored");
            return Ok(());
        }
        let path = self.inner.settings.active_config_path();
        self.start_locked(&path).await
    }

    /// Ask the platform to stop the tunnel. No-op unless connected.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _guard = self.lifecycle().await?;
        self.disconnect_locked().await
    }

    /// Tear everything down and register a fresh profile.
    ///
    /// Holds the lifecycle section throughout, so a `connect` issued
    /// meanwhile runs after the reset (or fails `Busy`).
    pub async fn reset(&self) -> Result<TunnelProfile, SessionError> {
        let _guard = self.lifecycle().await?;

        let state = self.state();
        if !state.is_inactive() {
            info!(%state, "Reset waiting for tunnel teardown");
            let settled = self.wait_until(|s| !s.is_transient()).await?;
            if settled.is_connected() {
                self.disconnect_locked().await?;
            }
            self.wait_until(SessionState::is_inactive).await?;
        }

        self.set_handle(None);
        self.inner.registrar.reset().await?;
        let profile = self.inner.registrar.ensure_profile().await?;
        info!(profile = %profile.id, "Reset complete");
        Ok(profile)
    }

    /// Apply a settings change to a running tunnel.
    ///
    /// Returns `None` when the tunnel is not connected (nothing to apply).
    /// A failed live reload is reported as is; it never falls back to a full
    /// restart.
    pub async fn restart_or_reload(
        &self,
        path: &str,
        profile_name: &str,
    ) -> Result<Option<RestartDecision>, SessionError> {
        let _guard = self.lifecycle().await?;

        let state = self.state();
        if !state.is_connected() {
            debug!(%state, "Restart ignored");
            return Ok(None);
        }

        let decision = if self.inner.settings.rebuild_service_mode() {
            RestartDecision::FullRestart
        } else {
            RestartDecision::LiveReload
        };
        info!(%decision, profile = profile_name, "Applying settings change");

        match decision {
            RestartDecision::FullRestart => {
                self.disconnect_locked().await?;
                // Let the platform finish tearing down before reusing the profile
                tokio::time::sleep(self.inner.config.restart_grace()).await;
                self.wait_until(SessionState::is_inactive).await?;
                self.start_locked(path).await?;
            }
            RestartDecision::LiveReload => {
                let channel = self.inner.commands.open().map_err(SessionError::Reload)?;
                channel.reload_service().await.map_err(SessionError::Reload)?;
            }
        }

        Ok(Some(decision))
    }

    /// One poll: elapsed time, system-wide VPN flag and (when connected) stats
    pub async fn poll_tick(&self) {
        let elapsed = self.elapsed();

        let probe = self.inner.probe.clone();
        let any_vpn_active = tokio::task::spawn_blocking(move || probe.any_vpn_active())
            .await
            .unwrap_or(false);

        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let mut sample = None;
        if self.state().is_connected() {
            if let Some(connection) = self.poll_connection() {
                // The tunnel may have gone down while we looked up the handle
                if self.state().is_connected() {
                    sample = self.inner.sampler.sample(connection.as_ref()).await;
                }
            }
        }

        let state = self.state();
        self.inner.snapshot.send_if_modified(|snapshot| {
            let before = *snapshot;
            snapshot.state = state;
            snapshot.elapsed = elapsed;
            snapshot.any_vpn_active = any_vpn_active;
            if let Some(stats) = sample {
                // Stale if the tunnel dropped or reconnected while we waited
                if state.is_connected() && self.inner.epoch.load(Ordering::Acquire) == epoch {
                    snapshot.stats = stats;
                } else {
                    debug!(%state, "Dropping stats from a finished connection");
                }
            }
            *snapshot != before
        });
    }

    /// Run the poll loop and status observer on a background task
    pub fn spawn(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run().await })
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut status = self.inner.status.clone();
        let mut last = *status.borrow_and_update();
        let mut watching = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_tick().await,
                changed = status.changed(), if watching => {
                    if changed.is_err() {
                        warn!("Platform status channel closed");
                        watching = false;
                    } else {
                        let state = *status.borrow_and_update();
                        if state != last {
                            self.observe(last, state);
                            last = state;
                        }
                    }
                }
            }
        }
    }

    /// Wait until the platform reports `target`
    pub async fn wait_for_state(&self, target: SessionState, within: Duration) -> bool {
        let mut status = self.inner.status.clone();
        let wait = async move {
            loop {
                let state = *status.borrow_and_update();
                if state == target {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(within, wait).await.unwrap_or(false)
    }

    fn observe(&self, previous: SessionState, state: SessionState) {
        info!(from = %previous, to = %state, "Tunnel status changed");

        if state.is_inactive() {
            self.set_handle(None);
        }
        if state == SessionState::Invalid && previous != SessionState::Invalid {
            warn!("Tunnel profile became unusable; reset required");
        }

        self.inner.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == state {
                return false;
            }
            snapshot.state = state;
            true
        });
    }

    async fn lifecycle(&self) -> Result<MutexGuard<'_, ()>, SessionError> {
        tokio::time::timeout(self.inner.config.lifecycle_wait(), self.inner.lifecycle.lock())
            .await
            .map_err(|_| {
                warn!("Lifecycle operation still in flight, giving up");
                SessionError::Busy
            })
    }

    async fn start_locked(&self, path: &str) -> Result<(), SessionError> {
        let blob = self.inner.settings.config_options();
        let options = ConfigOptions::parse(&blob);
        let config = self
            .inner
            .engine
            .build_config(path, &blob)
            .await
            .map_err(SessionError::Build)?;

        self.inner.settings.set_service_mode(options.service_mode)?;
        self.connect_locked(config, options.disable_memory_limit).await
    }

    async fn connect_locked(&self, config: String, disable_memory_limit: bool) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Disconnected {
            info!(%state, "Connect ignored");
            return Ok(());
        }

        // Bump before the reset so an in-flight sample cannot land on top of it
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.snapshot.send_modify(|snapshot| snapshot.stats = StatsSample::default());

        let profile = self.inner.registrar.enable_profile().await?;
        let connection = self
            .inner
            .platform
            .connection(&profile)
            .map_err(SessionError::TunnelStart)?;

        let options = TunnelOptions {
            config,
            disable_memory_limit,
        };
        connection.start(&options).await.map_err(|e| match e {
            PlatformError::PermissionDenied(msg) => SessionError::Permission(msg),
            other => SessionError::TunnelStart(other),
        })?;

        self.set_handle(Some(connection));
        self.set_connect_time(SystemTime::now());
        info!(profile = %profile.id, "Tunnel start requested");
        Ok(())
    }

    async fn disconnect_locked(&self) -> Result<(), SessionError> {
        let state = self.state();
        if !state.is_connected() {
            debug!(%state, "Disconnect ignored");
            return Ok(());
        }

        let connection = match self.handle() {
            Some(connection) => connection,
            None => {
                let profile = self.inner.registrar.ensure_profile().await?;
                self.inner
                    .platform
                    .connection(&profile)
                    .map_err(|e| SessionError::TunnelStop(e.to_string()))?
            }
        };
        connection
            .stop()
            .await
            .map_err(|e| SessionError::TunnelStop(e.to_string()))?;

        info!("Tunnel stop requested");
        Ok(())
    }

    /// Wait (bounded by the teardown timeout) for a state matching `done`
    async fn wait_until(&self, done: impl Fn(&SessionState) -> bool) -> Result<SessionState, SessionError> {
        let mut status = self.inner.status.clone();
        let wait = async move {
            loop {
                let state = *status.borrow_and_update();
                if done(&state) {
                    return Some(state);
                }
                if status.changed().await.is_err() {
                    return None;
                }
            }
        };

        match tokio::time::timeout(self.inner.config.teardown_timeout(), wait).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(SessionError::TunnelStop("platform status channel closed".into())),
            Err(_) => Err(SessionError::Timeout(self.state())),
        }
    }

    fn handle(&self) -> Option<Arc<dyn TunnelConnection>> {
        self.inner.handle.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_handle(&self, connection: Option<Arc<dyn TunnelConnection>>) {
        *self.inner.handle.lock().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    /// Handle for the poll loop, recovered from the cached profile after a
    /// relaunch. Never blocks on the profile store.
    fn poll_connection(&self) -> Option<Arc<dyn TunnelConnection>> {
        if let Some(connection) = self.handle() {
            return Some(connection);
        }
        let profile = self.inner.registrar.cached()?;
        let connection = self.inner.platform.connection(&profile).ok()?;
        self.set_handle(Some(connection.clone()));
        Some(connection)
    }

    fn set_connect_time(&self, at: SystemTime) {
        *self.inner.connect_time.write().unwrap_or_else(PoisonError::into_inner) = Some(at);
        if let Err(e) = self.inner.settings.set_connect_time(at) {
            warn!("Failed to persist connect time: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ServiceMode;
    use crate::simulation::{SimulatedEnvironment, StatsReply};
    use std::time::UNIX_EPOCH;

    const WAIT: Duration = Duration::from_secs(2);

    async fn connected_env() -> SimulatedEnvironment {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();
        env.controller.connect("{}", false).await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);
        env
    }

    #[tokio::test]
    async fn test_setup_observes_disconnected() {
        let env = SimulatedEnvironment::fast();
        assert_eq!(env.controller.state(), SessionState::Invalid);

        env.controller.setup().await.unwrap();
        assert_eq!(env.controller.state(), SessionState::Disconnected);
        assert_eq!(env.platform.profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_starts_tunnel() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();

        env.controller.connect("{\"outbounds\":[]}", true).await.unwrap();
        assert_eq!(env.controller.state(), SessionState::Connecting);
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);

        let options = env.platform.tunnel().last_options().unwrap();
        assert_eq!(options.config, "{\"outbounds\":[]}");
        assert!(options.disable_memory_limit);
        assert!(env.platform.profiles()[0].enabled);
        assert!(env.controller.connect_time().is_some());
        assert!(env.settings.connect_time().is_some());
    }

    #[tokio::test]
    async fn test_connect_is_noop_unless_disconnected() {
        let env = connected_env().await;
        let at = env.controller.connect_time();

        env.controller.connect("{}", false).await.unwrap();

        assert_eq!(env.platform.tunnel().start_count(), 1);
        assert_eq!(env.controller.connect_time(), at);
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_profile_enabled() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();
        env.platform.tunnel().set_reject_start(true);

        let result = env.controller.connect("{}", false).await;

        assert!(matches!(result, Err(SessionError::TunnelStart(_))));
        assert!(env.platform.profiles()[0].enabled);
        assert_eq!(env.controller.connect_time(), None);
        assert_eq!(env.controller.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_permission_errors() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();

        env.platform.set_deny_permission(true);
        let result = env.controller.connect("{}", false).await;
        assert!(matches!(result, Err(SessionError::Permission(_))));

        env.platform.set_deny_permission(false);
        env.platform.tunnel().set_deny_start(true);
        let result = env.controller.connect("{}", false).await;
        assert!(matches!(result, Err(SessionError::Permission(_))));
    }

    #[tokio::test]
    async fn test_connect_store_unreachable() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();
        env.platform.set_store_unreachable(true);

        let result = env.controller.connect("{}", false).await;
        assert!(matches!(
            result,
            Err(SessionError::Profile(RegistrarError::Persist(PlatformError::Unreachable(_))))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_connect_time() {
        let env = connected_env().await;
        let at = env.controller.connect_time();

        env.controller.disconnect().await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Disconnected, WAIT).await);

        assert_eq!(env.platform.tunnel().stop_count(), 1);
        assert_eq!(env.controller.connect_time(), at);
    }

    #[tokio::test]
    async fn test_disconnect_noop_when_not_connected() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();

        env.controller.disconnect().await.unwrap();
        assert_eq!(env.platform.tunnel().stop_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_time_survives_relaunch() {
        let env = SimulatedEnvironment::fast();
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        env.settings.set_connect_time(at).unwrap();

        // A second controller over the same settings, as after a relaunch
        let relaunched = SimulatedEnvironment::with_parts(
            env.controller.config().clone(),
            env.settings.clone(),
            env.logs.clone(),
            Arc::new(crate::detect::StaticInterfaceProbe::default()),
        );

        assert_eq!(relaunched.controller.connect_time(), Some(at));
        assert!(relaunched.controller.elapsed() > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_poll_samples_when_connected() {
        let env = connected_env().await;

        env.controller.poll_tick().await;
        env.controller.poll_tick().await;

        let snapshot = env.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert_eq!(snapshot.stats, StatsSample::new(2048, 8192));
    }

    #[tokio::test]
    async fn test_poll_skips_stats_when_disconnected() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();

        env.controller.poll_tick().await;

        let snapshot = env.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.stats, StatsSample::default());
        assert_eq!(snapshot.elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stats_reset_on_connect() {
        let env = connected_env().await;
        env.controller.poll_tick().await;
        assert_ne!(env.controller.snapshot().stats, StatsSample::default());

        env.controller.disconnect().await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Disconnected, WAIT).await);

        // No sample arrives in the new epoch
        env.platform.tunnel().set_stats_reply(StatsReply::Fixed("garbage".into()));
        env.controller.connect("{}", false).await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);
        env.controller.poll_tick().await;

        assert_eq!(env.controller.snapshot().stats, StatsSample::new(0, 0));
    }

    #[tokio::test]
    async fn test_poll_survives_stalled_tunnel() {
        let env = connected_env().await;
        env.platform.tunnel().set_stats_reply(StatsReply::Stall);

        tokio::time::timeout(Duration::from_secs(1), env.controller.poll_tick())
            .await
            .expect("poll tick must be bounded by the sample timeout");

        assert_eq!(env.controller.snapshot().stats, StatsSample::default());
    }

    fn slow_sample_env() -> SimulatedEnvironment {
        SimulatedEnvironment::new(ControllerConfig {
            sample_timeout_ms: 2000,
            restart_grace_ms: 10,
            teardown_timeout_ms: 1000,
            lifecycle_wait_ms: 2000,
            ..ControllerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_late_sample_dropped_after_reconnect() {
        let env = slow_sample_env();
        env.controller.setup().await.unwrap();
        env.controller.connect("{}", false).await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);
        env.platform.tunnel().set_stats_reply(StatsReply::Delayed(Duration::from_millis(300)));

        let controller = env.controller.clone();
        let tick = tokio::spawn(async move { controller.poll_tick().await });
        // Let the request reach the tunnel
        tokio::time::sleep(Duration::from_millis(30)).await;

        env.controller.disconnect().await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Disconnected, WAIT).await);
        env.controller.connect("{}", false).await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);
        tick.await.unwrap();

        let snapshot = env.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert_eq!(snapshot.stats, StatsSample::default());
    }

    #[tokio::test]
    async fn test_late_sample_dropped_after_disconnect() {
        let env = slow_sample_env();
        env.controller.setup().await.unwrap();
        env.controller.connect("{}", false).await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);
        env.controller.poll_tick().await;
        let before = env.controller.snapshot().stats;
        assert_eq!(before, StatsSample::new(1024, 4096));

        env.platform.tunnel().set_stats_reply(StatsReply::Delayed(Duration::from_millis(200)));
        let controller = env.controller.clone();
        let tick = tokio::spawn(async move { controller.poll_tick().await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        env.controller.disconnect().await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Disconnected, WAIT).await);
        tick.await.unwrap();

        let snapshot = env.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.stats, before);
    }

    #[tokio::test]
    async fn test_background_loop_polls_while_connected() {
        let env = connected_env().await;
        let poller = env.controller.spawn();

        // Several poll intervals, no manual ticks
        tokio::time::sleep(Duration::from_millis(220)).await;
        let first = env.controller.snapshot();
        assert_eq!(first.state, SessionState::Connected);
        assert_ne!(first.stats, StatsSample::default());
        assert!(first.elapsed > Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = env.controller.snapshot();
        assert!(second.stats.upload_bytes > first.stats.upload_bytes);
        assert!(second.stats.download_bytes > first.stats.download_bytes);
        assert!(second.elapsed > first.elapsed);

        env.controller.disconnect().await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Disconnected, WAIT).await);
        // A tick already past its state check may still finish
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopped = env.controller.snapshot().stats;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = env.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.stats, stopped);
        poller.abort();
    }

    #[tokio::test]
    async fn test_full_restart_on_service_mode_change() {
        let env = connected_env().await;
        let first_connect = env.controller.connect_time().unwrap();
        env.settings.set_config_options(r#"{"service-mode": "proxy"}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let decision = env.controller.restart_or_reload("/profiles/next.json", "next").await.unwrap();
        assert_eq!(decision, Some(RestartDecision::FullRestart));
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);

        let tunnel = env.platform.tunnel();
        assert_eq!(tunnel.stop_count(), 1);
        assert_eq!(tunnel.start_count(), 2);
        assert!(tunnel.last_options().unwrap().config.contains("/profiles/next.json"));
        assert!(env.controller.connect_time().unwrap() > first_connect);
        assert_eq!(env.engine.channel().reload_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_full_restart_stays_pending() {
        let env = connected_env().await;
        env.settings.set_config_options(r#"{"service-mode": "proxy"}"#).unwrap();
        env.platform.tunnel().set_reject_stop(true);

        let result = env.controller.restart_or_reload("/profiles/next.json", "next").await;
        assert!(matches!(result, Err(SessionError::TunnelStop(_))));
        assert_eq!(env.settings.service_mode(), ServiceMode::Vpn);
        assert_eq!(env.controller.state(), SessionState::Connected);

        // The mode change is still seen once the tunnel can stop
        env.platform.tunnel().set_reject_stop(false);
        let decision = env.controller.restart_or_reload("/profiles/next.json", "next").await.unwrap();
        assert_eq!(decision, Some(RestartDecision::FullRestart));
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);

        assert_eq!(env.settings.service_mode(), ServiceMode::Proxy);
        assert_eq!(env.platform.tunnel().start_count(), 2);
        assert_eq!(env.engine.channel().reload_count(), 0);
    }

    #[tokio::test]
    async fn test_live_reload_keeps_session() {
        let env = connected_env().await;
        let at = env.controller.connect_time();

        let decision = env.controller.restart_or_reload("/profiles/a.json", "a").await.unwrap();

        assert_eq!(decision, Some(RestartDecision::LiveReload));
        assert_eq!(env.engine.channel().reload_count(), 1);
        assert_eq!(env.platform.tunnel().stop_count(), 0);
        assert_eq!(env.controller.state(), SessionState::Connected);
        assert_eq!(env.controller.connect_time(), at);
    }

    #[tokio::test]
    async fn test_reload_failure_does_not_fall_back() {
        let env = connected_env().await;
        env.engine.channel().set_reject_reload(true);

        let result = env.controller.restart_or_reload("/profiles/a.json", "a").await;
        assert!(matches!(result, Err(SessionError::Reload(EngineError::Reload(_)))));

        env.engine.channel().set_reject_reload(false);
        env.engine.set_unreachable(true);
        let result = env.controller.restart_or_reload("/profiles/a.json", "a").await;
        assert!(matches!(result, Err(SessionError::Reload(EngineError::ChannelUnavailable(_)))));

        assert_eq!(env.platform.tunnel().stop_count(), 0);
        assert_eq!(env.controller.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_restart_noop_when_not_connected() {
        let env = SimulatedEnvironment::fast();
        env.controller.setup().await.unwrap();
        env.settings.set_config_options(r#"{"service-mode": "proxy"}"#).unwrap();

        let decision = env.controller.restart_or_reload("/p", "n").await.unwrap();

        assert_eq!(decision, None);
        assert_eq!(env.engine.channel().reload_count(), 0);
        assert_eq!(env.platform.tunnel().start_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_disconnects_and_reregisters() {
        let env = connected_env().await;
        let before = env.platform.profiles()[0].id.clone();

        let profile = env.controller.reset().await.unwrap();

        assert_ne!(profile.id, before);
        assert_eq!(env.platform.profiles().len(), 1);
        assert_eq!(env.platform.tunnel().stop_count(), 1);
        assert_eq!(env.controller.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_during_reset_runs_after_it() {
        let env = connected_env().await;

        let controller = env.controller.clone();
        let reset = tokio::spawn(async move { controller.reset().await });
        // Let the reset take the lifecycle section first
        tokio::time::sleep(Duration::from_millis(2)).await;
        env.controller.connect("{}", false).await.unwrap();

        let profile = reset.await.unwrap().unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);

        // The queued connect used the freshly registered profile
        let profiles = env.platform.profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, profile.id);
        assert!(profiles[0].enabled);
    }

    #[tokio::test]
    async fn test_busy_when_lifecycle_held_too_long() {
        let env = SimulatedEnvironment::new(ControllerConfig {
            lifecycle_wait_ms: 20,
            restart_grace_ms: 300,
            ..ControllerConfig::default()
        });
        env.controller.setup().await.unwrap();
        env.controller.connect("{}", false).await.unwrap();
        assert!(env.controller.wait_for_state(SessionState::Connected, WAIT).await);
        env.settings.set_config_options(r#"{"service-mode": "proxy"}"#).unwrap();

        let controller = env.controller.clone();
        let restart = tokio::spawn(async move { controller.restart_or_reload("/p", "n").await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = env.controller.disconnect().await;
        assert!(matches!(result, Err(SessionError::Busy)));

        assert_eq!(restart.await.unwrap().unwrap(), Some(RestartDecision::FullRestart));
    }

    #[tokio::test]
    async fn test_status_observer_releases_handle() {
        let env = connected_env().await;
        let poller = env.controller.spawn();

        // Platform tears the tunnel down on its own
        env.platform.report(SessionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(env.controller.handle().is_none());
        assert_eq!(env.controller.snapshot().state, SessionState::Disconnected);
        poller.abort();
    }
}
