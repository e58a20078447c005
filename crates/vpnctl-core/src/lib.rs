//! vpnctl core - VPN Session Controller
//!
//! Control plane for a platform-managed packet tunnel: keeps one tunnel
//! profile registered, drives connect/disconnect/restart against the OS VPN
//! subsystem, samples transfer stats and answers host commands.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Host (UI)                             │
//! └──────────────┬──────────────────────────────▲────────────────┘
//!                │ trigger + args               │ result / snapshot
//!                ▼                              │
//!  ┌──────────────────────────┐                 │
//!  │    CommandDispatcher     │─────────────────┤
//!  └─────────────┬────────────┘                 │
//!                ▼                              │
//!  ┌──────────────────────────┐   watch   ┌─────┴─────────────┐
//!  │    SessionController     │──────────▶│  SessionSnapshot  │
//!  │  (lifecycle + poll loop) │           └───────────────────┘
//!  └──┬──────────┬─────────┬──┘
//!     │          │         │
//!     ▼          ▼         ▼
//!  Registrar  Sampler   ConfigEngine / CommandChannel
//!     │          │
//!     ▼          ▼
//!  ┌──────────────────────────┐
//!  │   VpnPlatform (OS VPN)   │── status pushes ──▶ controller
//!  └──────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single profile**: adopted if present, registered otherwise
//! - **Externally driven state**: lifecycle state is observed, never assumed
//! - **Restart or reload**: full restart only when the service mode changes
//! - **Durable connect time**: elapsed time survives a relaunch

mod config;
mod controller;
mod detect;
mod dispatcher;
mod engine;
mod log_buffer;
mod platform;
mod registrar;
mod sampler;
mod settings;
mod state;

pub mod simulation;

pub use config::{ConfigError, ControllerConfig};
pub use controller::{Collaborators, SessionController, SessionError};
pub use detect::{InterfaceProbe, StaticInterfaceProbe, SystemInterfaceProbe, is_vpn_interface};
pub use dispatcher::{ALREADY_RUNNING, CommandDispatcher, DispatchError, NOT_RUNNING, Trigger};
pub use engine::{CommandChannel, CommandChannelFactory, ConfigEngine, EngineError, JsonConfigEngine};
pub use log_buffer::{LogBuffer, LogSink};
pub use platform::{PlatformError, ProfileId, TunnelConnection, TunnelOptions, TunnelProfile, VpnPlatform};
pub use registrar::{ProfileRegistrar, RegistrarError};
pub use sampler::{StatsSampler, parse_stats_reply};
pub use settings::{ConfigOptions, FileSettings, MemorySettings, ServiceMode, SettingsError, SettingsMirror, SettingsStore};
pub use state::{RestartDecision, SessionSnapshot, SessionState, StatsSample};
