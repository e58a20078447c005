//! Command Dispatcher
//!
//! Maps each host trigger to one controller (or config engine) operation and
//! turns the outcome into a single result. Arguments are validated before
//! anything is touched; every call stands alone, so one failing command never
//! affects another in flight.

use crate::controller::{SessionController, SessionError};
use crate::engine::EngineError;
use crate::log_buffer::LogSink;
use crate::registrar::RegistrarError;
use crate::settings::SettingsError;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a `start` that found the tunnel already up
pub const ALREADY_RUNNING: &str = "already running";
/// Result of a `stop` or `restart` that found the tunnel down
pub const NOT_RUNNING: &str = "not running";

/// Closed command vocabulary of the host surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    ParseConfig,
    ChangeConfigOptions,
    GenerateConfig,
    Start,
    Stop,
    Restart,
    SelectOutbound,
    UrlTest,
    ClearLogs,
}

impl Trigger {
    pub const ALL: [Trigger; 9] = [
        Trigger::ParseConfig,
        Trigger::ChangeConfigOptions,
        Trigger::GenerateConfig,
        Trigger::Start,
        Trigger::Stop,
        Trigger::Restart,
        Trigger::SelectOutbound,
        Trigger::UrlTest,
        Trigger::ClearLogs,
    ];

    /// Wire name of the trigger
    pub fn method(&self) -> &'static str {
        match self {
            Trigger::ParseConfig => "parse_config",
            Trigger::ChangeConfigOptions => "change_config_options",
            Trigger::GenerateConfig => "generate_config",
            Trigger::Start => "start",
            Trigger::Stop => "stop",
            Trigger::Restart => "restart",
            Trigger::SelectOutbound => "select_outbound",
            Trigger::UrlTest => "url_test",
            Trigger::ClearLogs => "clear_logs",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

impl FromStr for Trigger {
    type Err = DispatchError;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        Trigger::ALL
            .into_iter()
            .find(|trigger| trigger.method() == method)
            .ok_or_else(|| DispatchError::UnsupportedTrigger(method.to_string()))
    }
}

/// Per-call failure reported to the host
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported trigger: {0}")]
    UnsupportedTrigger(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl DispatchError {
    /// Stable code the host can match on
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidArgument(_) => "INVALID_ARGUMENT",
            DispatchError::UnsupportedTrigger(_) => "NOT_IMPLEMENTED",
            DispatchError::Session(err) => match err {
                SessionError::Profile(RegistrarError::Store(_)) => "PROFILE_STORE",
                SessionError::Profile(RegistrarError::Persist(_)) => "PROFILE_PERSIST",
                SessionError::Profile(RegistrarError::Permission(_)) | SessionError::Permission(_) => {
                    "PERMISSION_DENIED"
                }
                SessionError::TunnelStart(_) => "TUNNEL_START",
                SessionError::TunnelStop(_) => "TUNNEL_STOP",
                SessionError::Timeout(_) => "TIMEOUT",
                SessionError::Reload(EngineError::ChannelUnavailable(_)) => "ENGINE_UNAVAILABLE",
                SessionError::Reload(_) => "RELOAD_FAILED",
                SessionError::Build(_) => "BUILD_FAILED",
                SessionError::Busy => "BUSY",
                SessionError::Settings(_) => "SETTINGS",
            },
            DispatchError::Engine(err) => match err {
                EngineError::Parse(_) => "PARSE_FAILED",
                EngineError::Build(_) => "BUILD_FAILED",
                EngineError::ChannelUnavailable(_) => "ENGINE_UNAVAILABLE",
                EngineError::Reload(_) => "RELOAD_FAILED",
                EngineError::Select(_) => "SELECT_FAILED",
                EngineError::UrlTest(_) => "URL_TEST_FAILED",
            },
            DispatchError::Settings(_) => "SETTINGS",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParseConfigArgs {
    path: String,
    temp_path: String,
    debug: bool,
}

/// Optional profile switch carried by `start` and `restart`
#[derive(Debug, Default, Deserialize)]
struct ActiveProfileArgs {
    path: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateConfigArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectOutboundArgs {
    group_tag: String,
    outbound_tag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UrlTestArgs {
    group_tag: String,
}

fn decode<T: DeserializeOwned>(args: Value) -> Result<T, DispatchError> {
    if !args.is_object() {
        return Err(DispatchError::InvalidArgument("expected an argument map".into()));
    }
    serde_json::from_value(args).map_err(|e| DispatchError::InvalidArgument(e.to_string()))
}

fn decode_or_default<T: DeserializeOwned + Default>(args: Value) -> Result<T, DispatchError> {
    if args.is_null() {
        return Ok(T::default());
    }
    decode(args)
}

/// Host command dispatcher
#[derive(Clone)]
pub struct CommandDispatcher {
    controller: SessionController,
    logs: Arc<dyn LogSink>,
}

impl CommandDispatcher {
    pub fn new(controller: SessionController, logs: Arc<dyn LogSink>) -> Self {
        Self { controller, logs }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Dispatch a trigger by wire name
    pub async fn dispatch(&self, method: &str, args: Value) -> Result<Value, DispatchError> {
        let trigger = method.parse::<Trigger>().inspect_err(|_| {
            warn!(method, "Unsupported trigger");
        })?;
        self.execute(trigger, args).await
    }

    pub async fn execute(&self, trigger: Trigger, args: Value) -> Result<Value, DispatchError> {
        debug!(%trigger, "Dispatching");
        let result = self.run(trigger, args).await;
        if let Err(e) = &result {
            warn!(%trigger, code = e.code(), "Command failed: {}", e);
        }
        result
    }

    async fn run(&self, trigger: Trigger, args: Value) -> Result<Value, DispatchError> {
        let settings = self.controller.settings();

        match trigger {
            Trigger::ParseConfig => {
                let args: ParseConfigArgs = decode(args)?;
                let message = self
                    .controller
                    .config_engine()
                    .parse_config(&args.path, &args.temp_path, args.debug)
                    .await?;
                Ok(Value::String(message))
            }

            Trigger::ChangeConfigOptions => {
                let Value::String(blob) = args else {
                    return Err(DispatchError::InvalidArgument("expected an options string".into()));
                };
                settings.set_config_options(&blob)?;
                Ok(Value::Bool(true))
            }

            Trigger::GenerateConfig => {
                let args: GenerateConfigArgs = decode(args)?;
                let options = settings.config_options();
                if options.trim().is_empty() || args.path.trim().is_empty() {
                    return Err(DispatchError::InvalidArgument("blank properties".into()));
                }
                let config = self.controller.config_engine().build_config(&args.path, &options).await?;
                Ok(Value::String(config))
            }

            Trigger::Start => {
                let args: ActiveProfileArgs = decode_or_default(args)?;
                self.store_active_profile(&args)?;

                if self.controller.state().is_connected() {
                    info!("Tunnel already running");
                    return Ok(Value::from(ALREADY_RUNNING));
                }
                self.controller.start_active_profile().await?;
                Ok(Value::Bool(true))
            }

            Trigger::Stop => {
                if !self.controller.state().is_connected() {
                    info!("Tunnel not running");
                    return Ok(Value::from(NOT_RUNNING));
                }
                self.controller.disconnect().await?;
                Ok(Value::Bool(true))
            }

            Trigger::Restart => {
                let args: ActiveProfileArgs = decode_or_default(args)?;
                self.store_active_profile(&args)?;

                if !self.controller.state().is_connected() {
                    info!("Tunnel not running, settings apply on next start");
                    return Ok(Value::from(NOT_RUNNING));
                }
                // Re-read: path and name are separate keys
                let path = settings.active_config_path();
                let name = settings.active_profile_name();
                let decision = self.controller.restart_or_reload(&path, &name).await?;
                Ok(decision.map_or(Value::from(NOT_RUNNING), |d| Value::String(d.to_string())))
            }

            Trigger::SelectOutbound => {
                let args: SelectOutboundArgs = decode(args)?;
                let channel = self.controller.commands().open()?;
                channel.select_outbound(&args.group_tag, &args.outbound_tag).await?;
                Ok(Value::Bool(true))
            }

            Trigger::UrlTest => {
                let args: UrlTestArgs = decode(args)?;
                let channel = self.controller.commands().open()?;
                channel.url_test(&args.group_tag).await?;
                Ok(Value::Bool(true))
            }

            Trigger::ClearLogs => {
                self.logs.clear_logs();
                Ok(Value::Bool(true))
            }
        }
    }

    fn store_active_profile(&self, args: &ActiveProfileArgs) -> Result<(), DispatchError> {
        let settings = self.controller.settings();
        if let Some(path) = &args.path {
            settings.set_active_config_path(path)?;
        }
        if let Some(name) = &args.name {
            settings.set_active_profile_name(name)?;
        }
        Ok(())
    }
}
