//! vpnctl: VPN Session Controller
//!
//! Main entry point. Initializes the global allocator, sets up logging, wires
//! the controller to its collaborators and serves host commands as JSON lines
//! on stdin/stdout. Logs go to stderr and into the in-process log buffer.

mod host;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vpnctl_core::simulation::{SimulatedEngine, SimulatedPlatform};
use vpnctl_core::{
    Collaborators, CommandDispatcher, ControllerConfig, FileSettings, JsonConfigEngine, LogBuffer,
    SessionController, SettingsMirror, SystemInterfaceProbe,
};

use crate::host::{Reply, Request, StatusEvent};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "vpnctl", version, about = "VPN session controller")]
struct Args {
    /// Controller config (TOML)
    #[arg(long, env = "VPNCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Settings store (JSON), defaults to the user data directory
    #[arg(long, env = "VPNCTL_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective config as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the host protocol, so logs go to stderr and the buffer
    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(logs.clone())
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    let config = match &args.config {
        Some(path) => ControllerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    config.validate().context("Invalid controller config")?;

    if args.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let settings_path = args.settings.clone().unwrap_or_else(FileSettings::default_path);
    let store = FileSettings::open(settings_path.clone())
        .with_context(|| format!("Failed to open settings {}", settings_path.display()))?;
    info!("Settings at {}", store.path().display());

    info!("vpnctl starting...");
    info!("Using mimalloc allocator");

    // In-process platform and engine control surface
    let engine = Arc::new(SimulatedEngine::new());
    let controller = SessionController::new(
        config,
        Collaborators {
            platform: Arc::new(SimulatedPlatform::new()),
            engine: Arc::new(JsonConfigEngine::new()),
            commands: engine,
            settings: SettingsMirror::new(Arc::new(store)),
            probe: Arc::new(SystemInterfaceProbe),
        },
    );
    let profile = controller.setup().await.context("Failed to register tunnel profile")?;
    info!(profile = %profile.id, "Tunnel profile ready");

    let poller = controller.spawn();
    let dispatcher = CommandDispatcher::new(controller.clone(), Arc::new(logs));

    // Single writer keeps output lines whole
    let (out, mut lines_out) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines_out.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let status = {
        let out = out.clone();
        let mut snapshots = controller.subscribe();
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let event = StatusEvent::from(&*snapshots.borrow_and_update());
                emit(&out, &event);
            }
        })
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                emit(&out, &Reply::malformed(e.to_string()));
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        let out = out.clone();
        tokio::spawn(async move {
            debug!(id = request.id, method = %request.method, "Request");
            let reply = match dispatcher.dispatch(&request.method, request.args).await {
                Ok(value) => Reply::success(request.id, value),
                Err(e) => Reply::failure(request.id, &e),
            };
            emit(&out, &reply);
        });
    }

    info!("vpnctl shutting down ({})", controller.snapshot().stats.format());
    poller.abort();
    status.abort();
    drop(out);
    // In-flight requests still hold senders; the writer stops when they finish
    let _ = writer.await;
    Ok(())
}

fn emit<T: Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(mut line) => {
            line.push('\n');
            // Receiver only closes on shutdown
            let _ = out.send(line);
        }
        Err(e) => error!("Failed to encode message: {}", e),
    }
}
