//! In-process platform and engine
//!
//! Stand-ins for the OS VPN subsystem and the proxy engine, so the
//! controller can run without either. Status transitions happen on spawned
//! tasks after a settle delay, the way a real platform confirms them
//! asynchronously.
//!
//! Every collaborator has fault switches (`set_*`) and call counters used by
//! the test suites.

use crate::config::ControllerConfig;
use crate::controller::{Collaborators, SessionController};
use crate::detect::{InterfaceProbe, StaticInterfaceProbe};
use crate::dispatcher::CommandDispatcher;
use crate::engine::{CommandChannel, CommandChannelFactory, ConfigEngine, EngineError};
use crate::log_buffer::LogBuffer;
use crate::platform::{PlatformError, ProfileId, TunnelConnection, TunnelOptions, TunnelProfile, VpnPlatform};
use crate::sampler::STATS_REQUEST;
use crate::settings::SettingsMirror;
use crate::state::{SessionState, StatsSample};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Default delay before the platform confirms a transition
const DEFAULT_SETTLE: Duration = Duration::from_millis(20);

/// Bytes added to the counters per stats request
const UPLOAD_STEP: u64 = 1024;
const DOWNLOAD_STEP: u64 = 4096;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the simulated tunnel answers `stats`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsReply {
    /// Growing counters
    Counting,
    /// A fixed (possibly malformed) reply
    Fixed(String),
    /// Growing counters, answered after a delay
    Delayed(Duration),
    /// Never answer
    Stall,
}

/// Simulated tunnel session
pub struct SimulatedConnection {
    status: Arc<watch::Sender<SessionState>>,
    settle: Duration,
    counters: Mutex<StatsSample>,
    reply: Mutex<StatsReply>,
    last_options: Mutex<Option<TunnelOptions>>,
    reject_start: AtomicBool,
    reject_stop: AtomicBool,
    deny_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl SimulatedConnection {
    pub fn new(status: Arc<watch::Sender<SessionState>>, settle: Duration) -> Self {
        Self {
            status,
            settle,
            counters: Mutex::new(StatsSample::default()),
            reply: Mutex::new(StatsReply::Counting),
            last_options: Mutex::new(None),
            reject_start: AtomicBool::new(false),
            reject_stop: AtomicBool::new(false),
            deny_start: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn set_stats_reply(&self, reply: StatsReply) {
        *lock(&self.reply) = reply;
    }

    /// Fail `start` with a platform rejection
    pub fn set_reject_start(&self, reject: bool) {
        self.reject_start.store(reject, Ordering::Relaxed);
    }

    /// Fail `stop` with a platform rejection
    pub fn set_reject_stop(&self, reject: bool) {
        self.reject_stop.store(reject, Ordering::Relaxed);
    }

    /// Fail `start` with a permission denial
    pub fn set_deny_start(&self, deny: bool) {
        self.deny_start.store(deny, Ordering::Relaxed);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }

    /// Options passed to the most recent successful start
    pub fn last_options(&self) -> Option<TunnelOptions> {
        lock(&self.last_options).clone()
    }

    /// Advance the counters one step and render the reply
    fn count(&self) -> Vec<u8> {
        let mut counters = lock(&self.counters);
        counters.upload_bytes += UPLOAD_STEP;
        counters.download_bytes += DOWNLOAD_STEP;
        format!("{},{}", counters.upload_bytes, counters.download_bytes).into_bytes()
    }

    /// Move `from` to `to` after the settle delay, unless something else
    /// changed the status in between
    fn settle_into(&self, from: SessionState, to: SessionState) {
        let status = self.status.clone();
        let settle = self.settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            status.send_if_modified(|current| {
                if *current == from {
                    *current = to;
                    true
                } else {
                    false
                }
            });
        });
    }
}

#[async_trait]
impl TunnelConnection for SimulatedConnection {
    async fn start(&self, options: &TunnelOptions) -> Result<(), PlatformError> {
        if self.deny_start.load(Ordering::Relaxed) {
            return Err(PlatformError::PermissionDenied("user declined VPN configuration".into()));
        }
        if self.reject_start.load(Ordering::Relaxed) {
            return Err(PlatformError::Rejected("tunnel provider failed to launch".into()));
        }
        let current = *self.status.borrow();
        if current != SessionState::Disconnected {
            return Err(PlatformError::Rejected(format!("cannot start while {current}")));
        }

        self.starts.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_options) = Some(options.clone());
        *lock(&self.counters) = StatsSample::default();

        self.status.send_replace(SessionState::Connecting);
        self.settle_into(SessionState::Connecting, SessionState::Connected);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        if self.reject_stop.load(Ordering::Relaxed) {
            return Err(PlatformError::Rejected("tunnel provider did not stop".into()));
        }
        self.stops.fetch_add(1, Ordering::Relaxed);
        let current = *self.status.borrow();
        if matches!(current, SessionState::Connecting | SessionState::Connected) {
            self.status.send_replace(SessionState::Disconnecting);
            self.settle_into(SessionState::Disconnecting, SessionState::Disconnected);
        }
        Ok(())
    }

    async fn send_message(&self, message: &[u8]) -> Result<Vec<u8>, PlatformError> {
        if message != STATS_REQUEST {
            return Err(PlatformError::Rejected("unknown provider message".into()));
        }
        let connected = self.status.borrow().is_connected();
        if !connected {
            return Err(PlatformError::NotConnected);
        }

        let reply = lock(&self.reply).clone();
        match reply {
            StatsReply::Counting => Ok(self.count()),
            StatsReply::Delayed(delay) => {
                // Counters are read now, the answer arrives later
                let answer = self.count();
                tokio::time::sleep(delay).await;
                Ok(answer)
            }
            StatsReply::Fixed(text) => Ok(text.into_bytes()),
            StatsReply::Stall => std::future::pending().await,
        }
    }
}

/// Simulated platform VPN subsystem.
///
/// Status is `Invalid` until a profile exists, then `Disconnected`.
pub struct SimulatedPlatform {
    profiles: Mutex<Vec<TunnelProfile>>,
    status: Arc<watch::Sender<SessionState>>,
    connection: Arc<SimulatedConnection>,
    store_unreachable: AtomicBool,
    deny_permission: AtomicBool,
    saves: AtomicUsize,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::with_settle(DEFAULT_SETTLE)
    }

    pub fn with_settle(settle: Duration) -> Self {
        let status = Arc::new(watch::Sender::new(SessionState::Invalid));
        let connection = Arc::new(SimulatedConnection::new(status.clone(), settle));
        Self {
            profiles: Mutex::new(Vec::new()),
            status,
            connection,
            store_unreachable: AtomicBool::new(false),
            deny_permission: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    /// Persisted profiles
    pub fn profiles(&self) -> Vec<TunnelProfile> {
        lock(&self.profiles).clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SessionState {
        *self.status.borrow()
    }

    /// Push a status change as if the OS reported it
    pub fn report(&self, state: SessionState) {
        self.status.send_replace(state);
    }

    pub fn tunnel(&self) -> Arc<SimulatedConnection> {
        self.connection.clone()
    }

    pub fn set_store_unreachable(&self, unreachable: bool) {
        self.store_unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Refuse to persist enabled profiles
    pub fn set_deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::Relaxed);
    }

    fn check_store(&self) -> Result<(), PlatformError> {
        if self.store_unreachable.load(Ordering::Relaxed) {
            return Err(PlatformError::Unreachable("preferences daemon not responding".into()));
        }
        Ok(())
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VpnPlatform for SimulatedPlatform {
    async fn load_all(&self) -> Result<Vec<TunnelProfile>, PlatformError> {
        self.check_store()?;
        Ok(self.profiles())
    }

    async fn save(&self, profile: &TunnelProfile) -> Result<(), PlatformError> {
        self.check_store()?;
        if profile.enabled && self.deny_permission.load(Ordering::Relaxed) {
            return Err(PlatformError::PermissionDenied("VPN permission not granted".into()));
        }

        {
            let mut profiles = lock(&self.profiles);
            match profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(existing) => *existing = profile.clone(),
                None => profiles.push(profile.clone()),
            }
        }
        self.saves.fetch_add(1, Ordering::Relaxed);

        self.status.send_if_modified(|current| {
            if *current == SessionState::Invalid {
                *current = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn load(&self, id: &ProfileId) -> Result<TunnelProfile, PlatformError> {
        self.check_store()?;
        lock(&self.profiles)
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(id.clone()))
    }

    async fn remove(&self, id: &ProfileId) -> Result<(), PlatformError> {
        self.check_store()?;
        let now_empty = {
            let mut profiles = lock(&self.profiles);
            profiles.retain(|p| &p.id != id);
            profiles.is_empty()
        };
        if now_empty {
            self.status.send_replace(SessionState::Invalid);
        }
        Ok(())
    }

    fn connection(&self, profile: &TunnelProfile) -> Result<Arc<dyn TunnelConnection>, PlatformError> {
        if !lock(&self.profiles).iter().any(|p| p.id == profile.id) {
            return Err(PlatformError::NotFound(profile.id.clone()));
        }
        Ok(self.connection.clone())
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.status.subscribe()
    }
}

/// Simulated engine control surface
#[derive(Default)]
pub struct SimulatedChannel {
    reject_reload: AtomicBool,
    reloads: AtomicUsize,
    selections: Mutex<Vec<(String, String)>>,
    url_tests: Mutex<Vec<String>>,
}

impl SimulatedChannel {
    pub fn set_reject_reload(&self, reject: bool) {
        self.reject_reload.store(reject, Ordering::Relaxed);
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::Relaxed)
    }

    /// `(group, outbound)` pairs selected so far
    pub fn selections(&self) -> Vec<(String, String)> {
        lock(&self.selections).clone()
    }

    pub fn url_tests(&self) -> Vec<String> {
        lock(&self.url_tests).clone()
    }
}

#[async_trait]
impl CommandChannel for SimulatedChannel {
    async fn reload_service(&self) -> Result<(), EngineError> {
        if self.reject_reload.load(Ordering::Relaxed) {
            return Err(EngineError::Reload("engine refused new configuration".into()));
        }
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> Result<(), EngineError> {
        if group_tag.is_empty() {
            return Err(EngineError::Select("unknown group".into()));
        }
        lock(&self.selections).push((group_tag.to_string(), outbound_tag.to_string()));
        Ok(())
    }

    async fn url_test(&self, group_tag: &str) -> Result<(), EngineError> {
        if group_tag.is_empty() {
            return Err(EngineError::UrlTest("unknown group".into()));
        }
        lock(&self.url_tests).push(group_tag.to_string());
        Ok(())
    }
}

/// Simulated proxy engine: config engine plus command channel factory
#[derive(Default)]
pub struct SimulatedEngine {
    channel: Arc<SimulatedChannel>,
    unreachable: AtomicBool,
    reject_build: AtomicBool,
    parses: AtomicUsize,
    builds: AtomicUsize,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> Arc<SimulatedChannel> {
        self.channel.clone()
    }

    /// Make command channel construction fail, as when the engine is down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    pub fn set_reject_build(&self, reject: bool) {
        self.reject_build.store(reject, Ordering::Relaxed);
    }

    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConfigEngine for SimulatedEngine {
    async fn parse_config(&self, path: &str, temp_path: &str, _debug: bool) -> Result<String, EngineError> {
        self.parses.fetch_add(1, Ordering::Relaxed);
        if temp_path.is_empty() {
            return Err(EngineError::Parse("no source file".into()));
        }
        debug!("Simulated parse {} -> {}", temp_path, path);
        Ok(String::new())
    }

    async fn build_config(&self, path: &str, options: &str) -> Result<String, EngineError> {
        self.builds.fetch_add(1, Ordering::Relaxed);
        if self.reject_build.load(Ordering::Relaxed) {
            return Err(EngineError::Build(format!("{path}: invalid outbound")));
        }
        Ok(serde_json::json!({ "source": path, "options": options }).to_string())
    }
}

impl CommandChannelFactory for SimulatedEngine {
    fn open(&self) -> Result<Arc<dyn CommandChannel>, EngineError> {
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(EngineError::ChannelUnavailable("engine is not running".into()));
        }
        Ok(self.channel.clone())
    }
}

/// Controller and dispatcher wired to the simulated collaborators
pub struct SimulatedEnvironment {
    pub platform: Arc<SimulatedPlatform>,
    pub engine: Arc<SimulatedEngine>,
    pub settings: SettingsMirror,
    pub logs: LogBuffer,
    pub controller: SessionController,
    pub dispatcher: CommandDispatcher,
}

impl SimulatedEnvironment {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_parts(
            config,
            SettingsMirror::in_memory(),
            LogBuffer::default(),
            Arc::new(StaticInterfaceProbe::default()),
        )
    }

    /// Millisecond timings for tests
    pub fn fast() -> Self {
        Self::new(ControllerConfig {
            poll_interval_ms: 50,
            sample_timeout_ms: 25,
            restart_grace_ms: 10,
            teardown_timeout_ms: 1000,
            lifecycle_wait_ms: 2000,
            ..ControllerConfig::default()
        })
    }

    pub fn with_parts(
        config: ControllerConfig,
        settings: SettingsMirror,
        logs: LogBuffer,
        probe: Arc<dyn InterfaceProbe>,
    ) -> Self {
        let platform = Arc::new(SimulatedPlatform::new());
        let engine = Arc::new(SimulatedEngine::new());

        let controller = SessionController::new(
            config,
            Collaborators {
                platform: platform.clone(),
                engine: engine.clone(),
                commands: engine.clone(),
                settings: settings.clone(),
                probe,
            },
        );
        let dispatcher = CommandDispatcher::new(controller.clone(), Arc::new(logs.clone()));

        Self {
            platform,
            engine,
            settings,
            logs,
            controller,
            dispatcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_platform_status_follows_profiles() {
        let platform = SimulatedPlatform::new();
        assert_eq!(platform.status(), SessionState::Invalid);

        let profile = TunnelProfile::new("com.test.Tunnel", "Test");
        platform.save(&profile).await.unwrap();
        assert_eq!(platform.status(), SessionState::Disconnected);

        platform.remove(&profile.id).await.unwrap();
        assert_eq!(platform.status(), SessionState::Invalid);
    }

    #[tokio::test]
    async fn test_connection_settles() {
        let platform = SimulatedPlatform::with_settle(Duration::from_millis(5));
        let profile = TunnelProfile::new("com.test.Tunnel", "Test");
        platform.save(&profile).await.unwrap();
        let mut status = platform.subscribe();

        let tunnel = platform.connection(&profile).unwrap();
        tunnel
            .start(&TunnelOptions {
                config: "{}".into(),
                disable_memory_limit: false,
            })
            .await
            .unwrap();
        assert_eq!(platform.status(), SessionState::Connecting);

        status.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        tunnel.stop().await.unwrap();
        status.wait_for(|s| *s == SessionState::Disconnected).await.unwrap();
        assert_eq!(platform.tunnel().stop_count(), 1);
    }
}
